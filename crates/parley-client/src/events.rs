use parley_media::{RecordingStatus, TrackKind};
use parley_shared::{EndReason, LeaveReason, MediaState, UserId};

use crate::state::CallState;

pub const EVENT_STATE_CHANGED: &str = "state-changed";
pub const EVENT_PEER_ADDED: &str = "peer-added";
pub const EVENT_PEER_REMOVED: &str = "peer-removed";
pub const EVENT_PEER_CONNECTED: &str = "peer-connected";
pub const EVENT_PEER_FAILED: &str = "peer-failed";
pub const EVENT_REMOTE_MEDIA_CHANGED: &str = "remote-media-changed";
pub const EVENT_LOCAL_MEDIA_CHANGED: &str = "local-media-changed";
pub const EVENT_CAPABILITY_LOST: &str = "capability-lost";
pub const EVENT_HOST_CHANGED: &str = "host-changed";
pub const EVENT_CALL_ENDED: &str = "call-ended";
pub const EVENT_RECORDING_FINISHED: &str = "recording-finished";

/// Everything a surrounding UI layer needs to render one participant's
/// view of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallState),
    /// A remote joined the roster; its peer link is being negotiated.
    PeerAdded(UserId),
    /// A remote left the roster. Emitted exactly once per departure.
    PeerRemoved {
        user_id: UserId,
        reason: LeaveReason,
    },
    PeerConnected(UserId),
    /// The link to this remote gave up; the rest of the call is unaffected.
    PeerFailed(UserId),
    RemoteMediaChanged {
        user_id: UserId,
        media: MediaState,
    },
    LocalMediaChanged(MediaState),
    /// The call continues without this media type.
    CapabilityLost {
        kind: TrackKind,
        error: String,
    },
    HostChanged(UserId),
    CallEnded(EndReason),
    RecordingFinished(RecordingStatus),
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::StateChanged(_) => EVENT_STATE_CHANGED,
            CallEvent::PeerAdded(_) => EVENT_PEER_ADDED,
            CallEvent::PeerRemoved { .. } => EVENT_PEER_REMOVED,
            CallEvent::PeerConnected(_) => EVENT_PEER_CONNECTED,
            CallEvent::PeerFailed(_) => EVENT_PEER_FAILED,
            CallEvent::RemoteMediaChanged { .. } => EVENT_REMOTE_MEDIA_CHANGED,
            CallEvent::LocalMediaChanged(_) => EVENT_LOCAL_MEDIA_CHANGED,
            CallEvent::CapabilityLost { .. } => EVENT_CAPABILITY_LOST,
            CallEvent::HostChanged(_) => EVENT_HOST_CHANGED,
            CallEvent::CallEnded(_) => EVENT_CALL_ENDED,
            CallEvent::RecordingFinished(_) => EVENT_RECORDING_FINISHED,
        }
    }
}
