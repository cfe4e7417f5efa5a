use signal_store::StoreError;
use thiserror::Error;

use crate::engine::{EngineError, MediaError};
use crate::model::{DescriptionKind, SessionId};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session already holds a different {0} description")]
    DescriptionConflict(DescriptionKind),
    #[error("malformed signaling payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("session {0} has no offer")]
    SessionNotFound(SessionId),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error(transparent)]
    MediaUnavailable(#[from] MediaError),
    #[error("negotiator already started a session")]
    AlreadyInitiated,
    #[error("no session in progress")]
    NotStarted,
    #[error("invalid remote description: {0}")]
    InvalidRemoteDescription(String),
    #[error("transport engine error: {0}")]
    Engine(EngineError),
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),
    #[error("negotiator closed")]
    Closed,
}

impl From<EngineError> for NegotiationError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidCandidate(reason) => NegotiationError::InvalidCandidate(reason),
            EngineError::InvalidRemoteDescription(reason) => {
                NegotiationError::InvalidRemoteDescription(reason)
            }
            other => NegotiationError::Engine(other),
        }
    }
}

impl From<StoreError> for NegotiationError {
    fn from(err: StoreError) -> Self {
        NegotiationError::Signaling(SignalingError::Store(err))
    }
}
