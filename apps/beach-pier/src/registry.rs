use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::error::NegotiationError;
use crate::model::SessionId;
use crate::negotiation::{NegotiatorDeps, SessionNegotiator};

/// Sessions owned by this endpoint, keyed by session id.
///
/// Each entry has its own negotiator task, so sessions progress independently.
/// Entries are evicted once their session reaches a terminal state.
pub struct SessionRegistry {
    deps: NegotiatorDeps,
    sessions: Arc<DashMap<SessionId, SessionNegotiator>>,
}

impl SessionRegistry {
    pub fn new(deps: NegotiatorDeps) -> Self {
        Self {
            deps,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Acquires local media, publishes an offer and tracks the new session.
    pub async fn start_call(&self) -> Result<(SessionId, SessionNegotiator), NegotiationError> {
        let tracks = self.deps.media.acquire().await?;
        let negotiator = SessionNegotiator::spawn(self.deps.clone());
        let id = negotiator.initiate_session(tracks).await?;
        self.sessions.insert(id.clone(), negotiator.clone());
        self.evict_when_done(id.clone(), &negotiator);
        info!(target = "pier", session = %id, "call started");
        Ok((id, negotiator))
    }

    /// Answers an existing session.
    ///
    /// The id is claimed before any await, so concurrent answers to the same
    /// session cannot both proceed.
    pub async fn answer_call(&self, id: SessionId) -> Result<SessionNegotiator, NegotiationError> {
        let negotiator = match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(NegotiationError::AlreadyInitiated),
            Entry::Vacant(slot) => {
                let negotiator = SessionNegotiator::spawn(self.deps.clone());
                slot.insert(negotiator.clone());
                negotiator
            }
        };
        if let Err(err) = negotiator.respond_to_session(id.clone()).await {
            self.sessions
                .remove_if(&id, |_, tracked| tracked.same_session(&negotiator));
            return Err(err);
        }
        self.evict_when_done(id.clone(), &negotiator);
        info!(target = "pier", session = %id, "call answered");
        Ok(negotiator)
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionNegotiator> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Closes and forgets one session. Returns whether it was tracked.
    pub async fn close(&self, id: &SessionId) -> bool {
        let Some((_, negotiator)) = self.sessions.remove(id) else {
            return false;
        };
        negotiator.close().await;
        debug!(target = "pier", session = %id, "session closed");
        true
    }

    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Forgets `id` once its session ends on its own.
    ///
    /// The watcher holds only the state receiver, so it never keeps the session alive.
    fn evict_when_done(&self, id: SessionId, negotiator: &SessionNegotiator) {
        let sessions: Weak<DashMap<SessionId, SessionNegotiator>> = Arc::downgrade(&self.sessions);
        let mut states = negotiator.watch_state();
        tokio::spawn(async move {
            let _ = states.wait_for(|state| state.is_terminal()).await;
            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            if sessions
                .remove_if(&id, |_, current| current.watch_state().same_channel(&states))
                .is_some()
            {
                debug!(target = "pier", session = %id, "ended session evicted");
            }
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
