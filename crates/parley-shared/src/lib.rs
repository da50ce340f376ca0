// Data model, wire protocol and error taxonomy shared by every parley crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod types;

pub use error::CallError;
pub use protocol::{ServerEvent, Signal, SignalingMessage};
pub use transport::{EventStream, SignalingTransport};
pub use types::{
    CallId, CallSession, CallStatus, ConnectionStatus, EndReason, JoinResponse, LeaveReason,
    MediaState, NegotiationState, Participant, Role, RoomId, RoomSnapshot, TrackId, UserId,
};
