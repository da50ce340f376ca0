//! Local call state as seen by one participant.

use std::fmt;

use serde::{Deserialize, Serialize};

use parley_shared::{CallId, MediaState, NegotiationState, Role, TrackId, UserId};

/// Per-participant lifecycle: `idle → joining → active → leaving → ended`.
/// A failed join drops back to `idle`; a new join is allowed from `ended`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Joining,
    Active,
    Leaving,
    Ended,
}

impl CallState {
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Joining)
                | (Ended, Joining)
                | (Joining, Active)
                | (Joining, Idle)
                | (Active, Leaving)
                | (Leaving, Ended)
        )
    }

    /// Whether a join may start from here.
    pub fn can_join(self) -> bool {
        matches!(self, CallState::Idle | CallState::Ended)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallState::Idle => "idle",
            CallState::Joining => "joining",
            CallState::Active => "active",
            CallState::Leaving => "leaving",
            CallState::Ended => "ended",
        })
    }
}

/// One remote participant from the local point of view.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PeerSummary {
    pub user_id: UserId,
    pub role: Role,
    /// Advisory copy of the remote's media flags.
    pub media: MediaState,
    /// `None` once the link has failed and been torn down.
    pub link: Option<NegotiationState>,
    /// Audio track this side sends on the link.
    pub audio_track: Option<TrackId>,
}

/// Point-in-time view of a controller.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CallSnapshot {
    pub user_id: UserId,
    pub state: CallState,
    pub call_id: Option<CallId>,
    pub role: Option<Role>,
    pub host: Option<UserId>,
    pub media: MediaState,
    pub recording: bool,
    pub peers: Vec<PeerSummary>,
}

impl CallSnapshot {
    /// Remotes with a live peer link.
    pub fn linked_peers(&self) -> usize {
        self.peers.iter().filter(|p| p.link.is_some()).count()
    }

    pub fn peer(&self, user_id: &UserId) -> Option<&PeerSummary> {
        self.peers.iter().find(|p| &p.user_id == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        assert!(CallState::Idle.can_transition_to(CallState::Joining));
        assert!(CallState::Joining.can_transition_to(CallState::Active));
        assert!(CallState::Joining.can_transition_to(CallState::Idle));
        assert!(CallState::Active.can_transition_to(CallState::Leaving));
        assert!(CallState::Leaving.can_transition_to(CallState::Ended));
        assert!(CallState::Ended.can_transition_to(CallState::Joining));

        assert!(!CallState::Idle.can_transition_to(CallState::Active));
        assert!(!CallState::Active.can_transition_to(CallState::Ended));
        assert!(!CallState::Ended.can_transition_to(CallState::Active));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&CallState::Leaving).unwrap(),
            "\"leaving\""
        );
        assert_eq!(CallState::Active.to_string(), "active");
    }
}
