use thiserror::Error;

use crate::types::{CallId, RoomId, UserId};

/// Typed failures of the call subsystem's request surface.
///
/// Protocol races (a message for a departed participant) are not errors and
/// never show up here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("User {0} already holds a live participant in this call")]
    AlreadyJoined(UserId),

    #[error("User {0} is not a participant of this call")]
    NotAParticipant(UserId),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Malformed signaling message: {0}")]
    Malformed(String),

    #[error("Coordinator unavailable")]
    CoordinatorUnavailable,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl CallError {
    /// Stable machine-readable code used on the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            CallError::RoomNotFound(_) => "room_not_found",
            CallError::CallNotFound(_) => "call_not_found",
            CallError::AlreadyJoined(_) => "already_joined",
            CallError::NotAParticipant(_) => "not_a_participant",
            CallError::Forbidden(_) => "forbidden",
            CallError::RoomFull(_) => "room_full",
            CallError::Malformed(_) => "malformed",
            CallError::CoordinatorUnavailable => "coordinator_unavailable",
            CallError::Transport(_) => "transport",
        }
    }
}
