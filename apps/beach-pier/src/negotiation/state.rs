use crate::model::ConnectionState;

/// Progress of one side's negotiation.
///
/// Caller: `Idle → OfferSent → AnswerApplied → Connecting → Connected`.
/// Answerer: `Idle → OfferApplied → AnswerSent → Connecting → Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    AnswerApplied,
    OfferApplied,
    AnswerSent,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    /// Both descriptions are in place and the engine owns progress from here.
    fn descriptions_settled(self) -> bool {
        matches!(
            self,
            NegotiationState::AnswerApplied
                | NegotiationState::OfferApplied
                | NegotiationState::AnswerSent
        )
    }

    /// State reached when the engine reports `connection`, if it moves at all.
    pub fn on_connection(self, connection: ConnectionState) -> Option<NegotiationState> {
        if self.is_terminal() {
            return None;
        }
        match connection {
            ConnectionState::Failed => Some(NegotiationState::Failed),
            ConnectionState::Closed => Some(NegotiationState::Closed),
            ConnectionState::Connecting if self.descriptions_settled() => {
                Some(NegotiationState::Connecting)
            }
            ConnectionState::Connected
                if self.descriptions_settled() || self == NegotiationState::Connecting =>
            {
                Some(NegotiationState::Connected)
            }
            _ => None,
        }
    }
}
