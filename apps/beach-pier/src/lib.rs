pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod negotiation;
pub mod registry;

pub use config::PierConfig;
pub use error::{NegotiationError, SignalingError};
pub use model::{
    ConnectionState, DescriptionKind, IceCandidate, PublishedCandidate, Role, Session,
    SessionDescription, SessionId, Side,
};
pub use negotiation::{NegotiationState, NegotiatorDeps, SessionEvent, SessionNegotiator};
pub use registry::SessionRegistry;
