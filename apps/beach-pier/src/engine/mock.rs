//! Scripted engine and media source that record every call.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    EngineError, EngineEvent, EngineEvents, EngineFactory, MediaError, MediaKind, MediaSource,
    MediaTrack, TransportEngine,
};
use crate::model::{ConnectionState, IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    Close,
}

#[derive(Default)]
pub struct MockEngineFactory {
    engines: Mutex<Vec<Arc<MockEngine>>>,
    fail_create: bool,
    reject_marker: Option<String>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose `create` always fails.
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    /// Engines reject any candidate whose line contains `marker`.
    pub fn rejecting_candidates(marker: impl Into<String>) -> Self {
        Self {
            reject_marker: Some(marker.into()),
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockEngine>> {
        self.engines.lock().last().cloned()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self, events: EngineEvents) -> Result<Arc<dyn TransportEngine>, EngineError> {
        if self.fail_create {
            return Err(EngineError::Setup("mock factory configured to fail".into()));
        }
        let mut engines = self.engines.lock();
        let engine = Arc::new(MockEngine {
            label: engines.len(),
            calls: Mutex::new(Vec::new()),
            events,
            reject_marker: self.reject_marker.clone(),
        });
        engines.push(Arc::clone(&engine));
        Ok(engine)
    }
}

pub struct MockEngine {
    label: usize,
    calls: Mutex<Vec<EngineCall>>,
    events: EngineEvents,
    reject_marker: Option<String>,
}

impl MockEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EngineCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EngineCall::SetRemoteDescription(description) => Some(description.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.calls.lock().contains(&EngineCall::Close)
    }

    /// Calls recorded after the first `close`.
    pub fn calls_after_close(&self) -> Vec<EngineCall> {
        let calls = self.calls.lock();
        match calls.iter().position(|call| call == &EngineCall::Close) {
            Some(index) => calls[index + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Feeds an event to the negotiator as if the engine had raised it.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) -> bool {
        self.emit(EngineEvent::LocalCandidate(candidate))
    }

    pub fn emit_connection(&self, state: ConnectionState) -> bool {
        self.emit(EngineEvent::ConnectionState(state))
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError> {
        self.record(EngineCall::AddTrack(track.id.clone()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateOffer);
        Ok(SessionDescription::offer(format!("v=0 mock-offer-{}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0 mock-answer-{}", self.label)))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), EngineError> {
        self.record(EngineCall::SetLocalDescription(description.clone()));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetRemoteDescription(description.clone()));
        if !description.sdp.starts_with("v=0") {
            return Err(EngineError::InvalidRemoteDescription("sdp must start with v=0".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        self.record(EngineCall::AddIceCandidate(candidate.clone()));
        match &self.reject_marker {
            Some(marker) if candidate.candidate.contains(marker.as_str()) => Err(
                EngineError::InvalidCandidate(format!("mock engine rejects `{marker}`")),
            ),
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Close);
        Ok(())
    }
}

/// Media source with a fixed answer, counting how often it was asked.
pub struct MockMedia {
    tracks: Option<Vec<MediaTrack>>,
    acquisitions: AtomicUsize,
}

impl MockMedia {
    pub fn audio() -> Self {
        Self {
            tracks: Some(vec![MediaTrack::new("mic", "mock", MediaKind::Audio)]),
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            tracks: None,
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self) -> Result<Vec<MediaTrack>, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.tracks
            .clone()
            .ok_or_else(|| MediaError::Unavailable("mock media denied".into()))
    }
}
