//! The seam between a call client and the signaling coordinator.
//!
//! The coordinator implements it in-process; the client crate implements it
//! over HTTP + WebSocket. The call controller only ever sees this trait.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::protocol::{ServerEvent, SignalingMessage};
use crate::types::{CallId, JoinResponse, RoomId, UserId};

/// Ordered stream of coordinator events for one participant.
pub type EventStream = mpsc::UnboundedReceiver<ServerEvent>;

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Join the room's call, creating it if none is active.
    async fn join(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<(JoinResponse, EventStream), CallError>;

    /// Hand an envelope to the coordinator for relay. Heartbeats and
    /// media-state updates travel this way too.
    async fn send(&self, message: SignalingMessage) -> Result<(), CallError>;

    /// Graceful leave. Idempotent.
    async fn leave(&self, call_id: &CallId, user_id: &UserId) -> Result<(), CallError>;

    /// Host-only force end. Idempotent once the call is ended.
    async fn end(&self, call_id: &CallId, user_id: &UserId) -> Result<(), CallError>;
}
