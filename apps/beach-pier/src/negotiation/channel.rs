//! Signaling over the shared document store.
//!
//! A session is one document. Its `offer` and `answer` fields carry the
//! descriptions and its `offerCandidates` / `answerCandidates` collections carry
//! the trickled candidates. Everything read back from the store is validated here
//! so malformed entries never reach the transport engine.

use std::sync::Arc;

use serde_json::Value;
use signal_store::{ChangeKind, CollectionWatch, Document, DocumentWatch, SharedStore};
use tracing::{debug, trace, warn};

use crate::error::SignalingError;
use crate::model::{
    DescriptionKind, IceCandidate, PublishedCandidate, Session, SessionDescription, SessionId,
    Side,
};

#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn SharedStore>,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Writes `description` into its field, never replacing a different one.
    ///
    /// The conflict check and the write are separate store calls; two publishers
    /// racing on the same field can both pass the check.
    pub async fn publish_description(
        &self,
        session: &SessionId,
        description: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let field = description.kind.field();
        let existing = self
            .store
            .get(session.as_str())
            .await?
            .and_then(|mut document| document.remove(field));

        if let Some(existing) = existing {
            let same = serde_json::from_value::<SessionDescription>(existing)
                .map(|stored| &stored == description)
                .unwrap_or(false);
            if same {
                debug!(target = "pier", %session, kind = %description.kind, "description already published");
                return Ok(());
            }
            return Err(SignalingError::DescriptionConflict(description.kind));
        }

        let mut fields = Document::new();
        fields.insert(field.to_string(), to_value(description)?);
        self.store.set(session.as_str(), fields).await?;
        debug!(target = "pier", %session, kind = %description.kind, "description published");
        Ok(())
    }

    /// Appends `candidate` to `side`'s collection and returns its sequence number.
    pub async fn publish_candidate(
        &self,
        session: &SessionId,
        side: Side,
        candidate: &IceCandidate,
    ) -> Result<u64, SignalingError> {
        candidate.validate().map_err(SignalingError::Malformed)?;
        let sequence = self
            .store
            .append_to_collection(session.as_str(), side.collection(), to_value(candidate)?)
            .await?;
        debug!(target = "pier", %session, ?side, sequence, "candidate published");
        Ok(sequence)
    }

    pub async fn subscribe_description(
        &self,
        session: &SessionId,
    ) -> Result<DescriptionSubscription, SignalingError> {
        let watch = self.store.subscribe(session.as_str()).await?;
        Ok(DescriptionSubscription {
            session: session.clone(),
            watch,
        })
    }

    pub async fn subscribe_candidates(
        &self,
        session: &SessionId,
        side: Side,
    ) -> Result<CandidateSubscription, SignalingError> {
        let watch = self
            .store
            .subscribe_collection(session.as_str(), side.collection())
            .await?;
        Ok(CandidateSubscription {
            session: session.clone(),
            side,
            watch,
            next_sequence: 0,
        })
    }

    /// Reads the whole session, or `None` when no document exists.
    pub async fn fetch_session(&self, session: &SessionId) -> Result<Option<Session>, SignalingError> {
        let Some(document) = self.store.get(session.as_str()).await? else {
            return Ok(None);
        };
        let descriptions = DescriptionSnapshot::from_document(session, Some(document));

        let offer_candidates = self.list_candidates(session, Side::Offer).await?;
        let answer_candidates = self.list_candidates(session, Side::Answer).await?;

        Ok(Some(Session {
            id: session.clone(),
            offer: descriptions.offer,
            answer: descriptions.answer,
            offer_candidates,
            answer_candidates,
        }))
    }

    async fn list_candidates(
        &self,
        session: &SessionId,
        side: Side,
    ) -> Result<Vec<PublishedCandidate>, SignalingError> {
        let items = self
            .store
            .list_collection(session.as_str(), side.collection())
            .await?;
        Ok(items
            .into_iter()
            .filter_map(|item| decode_candidate(session, side, item.index, item.value))
            .collect())
    }
}

/// Valid descriptions present in the session document at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptionSnapshot {
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
}

impl DescriptionSnapshot {
    fn from_document(session: &SessionId, document: Option<Document>) -> Self {
        let Some(mut document) = document else {
            return Self::default();
        };
        Self {
            offer: decode_description(session, DescriptionKind::Offer, document.remove("offer")),
            answer: decode_description(session, DescriptionKind::Answer, document.remove("answer")),
        }
    }

    pub fn get(&self, kind: DescriptionKind) -> Option<&SessionDescription> {
        match kind {
            DescriptionKind::Offer => self.offer.as_ref(),
            DescriptionKind::Answer => self.answer.as_ref(),
        }
    }
}

/// Current description state first, then again after every document change.
pub struct DescriptionSubscription {
    session: SessionId,
    watch: DocumentWatch,
}

impl DescriptionSubscription {
    pub async fn next(&mut self) -> Option<DescriptionSnapshot> {
        let document = self.watch.next().await?;
        trace!(target = "pier", session = %self.session, "description change delivered");
        Some(DescriptionSnapshot::from_document(&self.session, document))
    }
}

/// Newly appended candidates of one side, in publish order and each at most once.
pub struct CandidateSubscription {
    session: SessionId,
    side: Side,
    watch: CollectionWatch,
    next_sequence: u64,
}

impl CandidateSubscription {
    pub async fn next(&mut self) -> Option<PublishedCandidate> {
        loop {
            let change = self.watch.next().await?;
            let sequence = change.item.index;
            trace!(
                target = "pier",
                session = %self.session,
                side = ?self.side,
                sequence,
                kind = ?change.kind,
                "candidate change delivered"
            );
            if change.kind != ChangeKind::Added {
                continue;
            }
            if sequence < self.next_sequence {
                continue;
            }
            self.next_sequence = sequence + 1;
            if let Some(candidate) =
                decode_candidate(&self.session, self.side, sequence, change.item.value)
            {
                return Some(candidate);
            }
        }
    }
}

fn decode_description(
    session: &SessionId,
    kind: DescriptionKind,
    value: Option<Value>,
) -> Option<SessionDescription> {
    let value = value.filter(|value| !value.is_null())?;
    let description = match serde_json::from_value::<SessionDescription>(value) {
        Ok(description) => description,
        Err(err) => {
            warn!(target = "pier", %session, %kind, error = %err, "dropping undecodable description");
            return None;
        }
    };
    if let Err(reason) = description.validate(kind) {
        warn!(target = "pier", %session, %kind, %reason, "dropping invalid description");
        return None;
    }
    Some(description)
}

fn decode_candidate(
    session: &SessionId,
    side: Side,
    sequence: u64,
    value: Value,
) -> Option<PublishedCandidate> {
    let candidate = match serde_json::from_value::<IceCandidate>(value) {
        Ok(candidate) => candidate,
        Err(err) => {
            warn!(target = "pier", %session, ?side, sequence, error = %err, "dropping undecodable candidate");
            return None;
        }
    };
    if let Err(reason) = candidate.validate() {
        warn!(target = "pier", %session, ?side, sequence, %reason, "dropping invalid candidate");
        return None;
    }
    Some(PublishedCandidate {
        side,
        sequence,
        candidate,
    })
}

fn to_value<T: serde::Serialize>(payload: &T) -> Result<Value, SignalingError> {
    serde_json::to_value(payload).map_err(|err| SignalingError::Malformed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signal_store::MemoryStore;

    fn channel() -> (Arc<MemoryStore>, SignalingChannel) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), SignalingChannel::new(store))
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.2 {n} typ host"), Some("0"), Some(0))
    }

    #[tokio::test]
    async fn identical_republish_is_a_no_op_and_different_one_conflicts() {
        let (_, channel) = channel();
        let session = SessionId::generate();
        let offer = SessionDescription::offer("v=0 first");

        channel.publish_description(&session, &offer).await.unwrap();
        channel.publish_description(&session, &offer).await.unwrap();

        let err = channel
            .publish_description(&session, &SessionDescription::offer("v=0 second"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::DescriptionConflict(DescriptionKind::Offer)));

        let stored = channel.fetch_session(&session).await.unwrap().unwrap();
        assert_eq!(stored.offer, Some(offer));
        assert_eq!(stored.answer, None);
    }

    #[tokio::test]
    async fn answer_merges_into_existing_session() {
        let (_, channel) = channel();
        let session = SessionId::generate();
        channel
            .publish_description(&session, &SessionDescription::offer("v=0 o"))
            .await
            .unwrap();
        channel
            .publish_description(&session, &SessionDescription::answer("v=0 a"))
            .await
            .unwrap();

        let stored = channel.fetch_session(&session).await.unwrap().unwrap();
        assert!(stored.offer.is_some());
        assert_eq!(stored.answer, Some(SessionDescription::answer("v=0 a")));
    }

    #[tokio::test]
    async fn missing_session_fetches_as_none() {
        let (_, channel) = channel();
        assert!(channel.fetch_session(&SessionId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn description_subscription_starts_with_current_state_and_drops_mismatched_type() {
        let (store, channel) = channel();
        let session = SessionId::generate();
        let mut descriptions = channel.subscribe_description(&session).await.unwrap();
        assert_eq!(descriptions.next().await, Some(DescriptionSnapshot::default()));

        // An offer payload stored under the answer field is rejected.
        let mut fields = Document::new();
        fields.insert("answer".into(), json!({ "type": "offer", "sdp": "v=0" }));
        store.set(session.as_str(), fields).await.unwrap();
        assert_eq!(descriptions.next().await, Some(DescriptionSnapshot::default()));

        channel
            .publish_description(&session, &SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let snapshot = descriptions.next().await.unwrap();
        assert_eq!(snapshot.get(DescriptionKind::Offer), Some(&SessionDescription::offer("v=0")));
        assert_eq!(snapshot.answer, None);
    }

    #[tokio::test]
    async fn candidate_subscription_yields_only_new_valid_additions() {
        let (store, channel) = channel();
        let session = SessionId::generate();
        let collection = Side::Offer.collection();

        assert_eq!(
            channel.publish_candidate(&session, Side::Offer, &candidate(0)).await.unwrap(),
            0
        );
        let mut subscription = channel
            .subscribe_candidates(&session, Side::Offer)
            .await
            .unwrap();

        store
            .append_to_collection(session.as_str(), collection, json!({ "candidate": "" }))
            .await
            .unwrap();
        channel.publish_candidate(&session, Side::Offer, &candidate(2)).await.unwrap();
        store
            .update_item(session.as_str(), collection, 0, serde_json::to_value(candidate(9)).unwrap())
            .unwrap();
        store.remove_item(session.as_str(), collection, 2).unwrap();
        channel.publish_candidate(&session, Side::Offer, &candidate(3)).await.unwrap();
        channel.publish_candidate(&session, Side::Answer, &candidate(7)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let published = subscription.next().await.unwrap();
            assert_eq!(published.side, Side::Offer);
            seen.push((published.sequence, published.candidate));
        }
        assert_eq!(
            seen,
            vec![(0, candidate(0)), (2, candidate(2)), (3, candidate(3))]
        );
    }

    #[tokio::test]
    async fn malformed_local_candidate_is_not_published() {
        let (store, channel) = channel();
        let session = SessionId::generate();
        let err = channel
            .publish_candidate(&session, Side::Answer, &IceCandidate::new("candidate:1", None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Malformed(_)));
        assert!(
            store
                .list_collection(session.as_str(), Side::Answer.collection())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
