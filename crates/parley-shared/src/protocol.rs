use serde::{Deserialize, Serialize};

use crate::types::{CallId, EndReason, LeaveReason, MediaState, Participant, UserId};

/// Payload of a signaling envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    /// SDP offer
    Offer { sdp: String },
    /// SDP answer
    Answer { sdp: String },
    /// Network-path (ICE) candidate
    Candidate { candidate: String },
    /// Sender's media flags changed
    MediaState(MediaState),
    /// Graceful departure
    Leave,
    /// Liveness ping
    Heartbeat,
}

impl Signal {
    /// Types relayed to one addressed participant.
    pub fn is_targeted(&self) -> bool {
        matches!(
            self,
            Signal::Offer { .. } | Signal::Answer { .. } | Signal::Candidate { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
            Signal::MediaState(_) => "media-state",
            Signal::Leave => "leave",
            Signal::Heartbeat => "heartbeat",
        }
    }
}

/// Immutable relay envelope. The coordinator routes these and never stores
/// them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalingMessage {
    pub call_id: CallId,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<UserId>,
    pub payload: Signal,
}

impl SignalingMessage {
    pub fn to(call_id: CallId, sender: UserId, target: UserId, payload: Signal) -> Self {
        Self {
            call_id,
            sender,
            target: Some(target),
            payload,
        }
    }

    pub fn broadcast(call_id: CallId, sender: UserId, payload: Signal) -> Self {
        Self {
            call_id,
            sender,
            target: None,
            payload,
        }
    }

    /// Targeted types must carry a target; broadcast types must not.
    pub fn is_well_formed(&self) -> bool {
        self.payload.is_targeted() == self.target.is_some()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Everything the coordinator pushes down a participant's channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantLeft {
        user_id: UserId,
        reason: LeaveReason,
    },
    HostChanged {
        user_id: UserId,
    },
    Signal {
        message: SignalingMessage,
    },
    CallEnded {
        call_id: CallId,
        reason: EndReason,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
