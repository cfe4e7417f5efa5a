//! Offer/answer negotiation with trickled candidates relayed through a shared store.

pub mod buffer;
pub mod channel;
pub mod negotiator;
pub mod state;

pub use buffer::{Admission, CandidateBuffer};
pub use channel::{
    CandidateSubscription, DescriptionSnapshot, DescriptionSubscription, SignalingChannel,
};
pub use negotiator::{NegotiatorDeps, SessionEvent, SessionNegotiator};
pub use state::NegotiationState;
