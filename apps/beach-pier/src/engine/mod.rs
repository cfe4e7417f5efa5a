//! Seam between negotiation and the real-time transport.
//!
//! The negotiator only talks to [`TransportEngine`]; engines report their
//! callbacks as [`EngineEvent`]s on the queue handed to [`EngineFactory::create`].

pub mod mock;
mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{ConnectionState, IceCandidate, SessionDescription};

pub use self::rtc::{RtcEngine, RtcEngineFactory, SettingsFn, VirtualNetwork};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine rejected candidate: {0}")]
    InvalidCandidate(String),
    #[error("engine rejected remote description: {0}")]
    InvalidRemoteDescription(String),
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("engine closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no local media available: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Local track handed to the engine before the offer or answer is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ConnectionState(ConnectionState),
}

pub type EngineEvents = mpsc::UnboundedSender<EngineEvent>;

#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError>;
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, description: &SessionDescription)
    -> Result<(), EngineError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, events: EngineEvents) -> Result<Arc<dyn TransportEngine>, EngineError>;
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Vec<MediaTrack>, MediaError>;
}

/// Describes one audio and one video track without capturing anything.
#[derive(Debug, Clone)]
pub struct SyntheticMedia {
    stream_id: String,
}

impl SyntheticMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self::new("beach-pier")
    }
}

#[async_trait]
impl MediaSource for SyntheticMedia {
    async fn acquire(&self) -> Result<Vec<MediaTrack>, MediaError> {
        Ok(vec![
            MediaTrack::new("audio", &self.stream_id, MediaKind::Audio),
            MediaTrack::new("video", &self.stream_id, MediaKind::Video),
        ])
    }
}
