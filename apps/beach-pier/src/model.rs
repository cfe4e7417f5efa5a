use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one negotiated session in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    /// Document field the description is stored under.
    pub fn field(self) -> &'static str {
        match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
        }
    }
}

impl fmt::Display for DescriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Checks the payload is usable as a description of `expected` kind.
    pub fn validate(&self, expected: DescriptionKind) -> Result<(), String> {
        if self.kind != expected {
            return Err(format!("expected {expected} description, found {}", self.kind));
        }
        if self.sdp.trim().is_empty() {
            return Err(format!("{} description has an empty sdp", self.kind));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<&str>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.map(str::to_string),
            sdp_mline_index,
            username_fragment: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.candidate.trim().is_empty() {
            return Err("candidate line is empty".into());
        }
        if self.sdp_mid.is_none() && self.sdp_mline_index.is_none() {
            return Err("candidate has neither sdpMid nor sdpMLineIndex".into());
        }
        Ok(())
    }
}

/// Which half of the session a candidate collection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Offer,
    Answer,
}

impl Side {
    pub fn collection(self) -> &'static str {
        match self {
            Side::Offer => "offerCandidates",
            Side::Answer => "answerCandidates",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedCandidate {
    pub side: Side,
    /// Index in the side's collection.
    pub sequence: u64,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Caller,
    Answerer,
}

impl Role {
    pub fn local_kind(self) -> DescriptionKind {
        match self {
            Role::Caller => DescriptionKind::Offer,
            Role::Answerer => DescriptionKind::Answer,
        }
    }

    pub fn remote_kind(self) -> DescriptionKind {
        match self {
            Role::Caller => DescriptionKind::Answer,
            Role::Answerer => DescriptionKind::Offer,
        }
    }

    pub fn local_side(self) -> Side {
        match self {
            Role::Caller => Side::Offer,
            Role::Answerer => Side::Answer,
        }
    }

    pub fn remote_side(self) -> Side {
        match self {
            Role::Caller => Side::Answer,
            Role::Answerer => Side::Offer,
        }
    }
}

/// Connectivity reported by the transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub offer_candidates: Vec<PublishedCandidate>,
    pub answer_candidates: Vec<PublishedCandidate>,
}

impl Session {
    pub fn description(&self, kind: DescriptionKind) -> Option<&SessionDescription> {
        match kind {
            DescriptionKind::Offer => self.offer.as_ref(),
            DescriptionKind::Answer => self.answer.as_ref(),
        }
    }

    pub fn candidates(&self, side: Side) -> &[PublishedCandidate] {
        match side {
            Side::Offer => &self.offer_candidates,
            Side::Answer => &self.answer_candidates,
        }
    }
}
