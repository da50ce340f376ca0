//! Signaling coordinator.
//!
//! Each open room is owned by one actor task holding its [`RoomState`]. All
//! joins, relays, heartbeats, leaves and ends for that room are serialized
//! through the actor's command channel, and the actor also runs the periodic
//! liveness sweep. The `Coordinator` handle itself only keeps the room
//! registry and a call-id index, so it is cheap to clone into HTTP handlers.
//! Ended calls are dropped from the index by their room's sweep once the
//! retention window has passed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use parley_shared::constants::{
    ENDED_CALL_RETENTION_MS, HEARTBEAT_SWEEP_MS, HEARTBEAT_TIMEOUT_MS,
};
use parley_shared::{
    CallError, CallId, EventStream, JoinResponse, LeaveReason, RoomId, RoomSnapshot,
    SignalingMessage, SignalingTransport, UserId,
};

use crate::room::{RelayOutcome, RoomState};

/// Capacity of each room's command queue.
const ROOM_QUEUE: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;
type CallIndex = Arc<RwLock<HashMap<CallId, RoomId>>>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A participant silent for longer than this is removed.
    pub liveness_window: Duration,
    /// How often each room checks its liveness timers.
    pub sweep_interval: Duration,
    /// Maximum participants per call (0 = unlimited).
    pub max_participants: usize,
    /// How long an ended call still resolves for leaves and uploads.
    pub ended_call_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            sweep_interval: Duration::from_millis(HEARTBEAT_SWEEP_MS),
            max_participants: 0,
            ended_call_retention: Duration::from_millis(ENDED_CALL_RETENTION_MS),
        }
    }
}

enum RoomCommand {
    Join {
        user_id: UserId,
        reply: Reply<(JoinResponse, EventStream)>,
    },
    Relay {
        message: SignalingMessage,
        reply: Reply<RelayOutcome>,
    },
    Leave {
        call_id: CallId,
        user_id: UserId,
        reply: Reply<()>,
    },
    End {
        call_id: CallId,
        user_id: UserId,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

struct RoomHandle {
    commands: mpsc::Sender<RoomCommand>,
    task: JoinHandle<()>,
}

struct Inner {
    rooms: RwLock<HashMap<RoomId, RoomHandle>>,
    calls: CallIndex,
    config: CoordinatorConfig,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for handle in self.rooms.get_mut().values() {
            handle.task.abort();
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: RwLock::new(HashMap::new()),
                calls: Arc::new(RwLock::new(HashMap::new())),
                config,
            }),
        }
    }

    /// Register `room_id`. Returns false if it was already open.
    pub async fn open_room(&self, room_id: RoomId) -> bool {
        let mut rooms = self.inner.rooms.write().await;
        if rooms.contains_key(&room_id) {
            return false;
        }

        let (tx, rx) = mpsc::channel(ROOM_QUEUE);
        let state = RoomState::new(
            room_id.clone(),
            self.inner.config.liveness_window,
            self.inner.config.max_participants,
        );
        let task = tokio::spawn(run_room(
            state,
            rx,
            self.inner.calls.clone(),
            self.inner.config.clone(),
        ));
        rooms.insert(
            room_id.clone(),
            RoomHandle {
                commands: tx,
                task,
            },
        );

        info!(room = %room_id, "Opened room");
        true
    }

    pub async fn list_rooms(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.inner.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn snapshot(&self, room_id: &RoomId) -> Result<RoomSnapshot, CallError> {
        let commands = self.room_commands(room_id).await?;
        let (tx, rx) = oneshot::channel();
        commands
            .send(RoomCommand::Snapshot { reply: tx })
            .await
            .map_err(|_| CallError::CoordinatorUnavailable)?;
        rx.await.map_err(|_| CallError::CoordinatorUnavailable)
    }

    /// Join `room_id`'s call, creating it if none is active.
    pub async fn join(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<(JoinResponse, EventStream), CallError> {
        let commands = self.room_commands(room_id).await?;
        request(&commands, |reply| RoomCommand::Join {
            user_id: user_id.clone(),
            reply,
        })
        .await
    }

    /// Validate and route an envelope from a participant.
    pub async fn relay(&self, message: SignalingMessage) -> Result<RelayOutcome, CallError> {
        let commands = self.call_commands(&message.call_id).await?;
        request(&commands, |reply| RoomCommand::Relay { message, reply }).await
    }

    /// Reset `user_id`'s liveness timer.
    pub async fn heartbeat(&self, call_id: &CallId, user_id: &UserId) -> Result<(), CallError> {
        let message = SignalingMessage::broadcast(
            *call_id,
            user_id.clone(),
            parley_shared::Signal::Heartbeat,
        );
        self.relay(message).await.map(|_| ())
    }

    /// Graceful leave. Leaving a call that is already over is a no-op.
    pub async fn leave(&self, call_id: &CallId, user_id: &UserId) -> Result<(), CallError> {
        let commands = self.call_commands(call_id).await?;
        request(&commands, |reply| RoomCommand::Leave {
            call_id: *call_id,
            user_id: user_id.clone(),
            reply,
        })
        .await
    }

    /// Host-only force end. Ending a call that is already over is a no-op.
    pub async fn end(&self, call_id: &CallId, user_id: &UserId) -> Result<(), CallError> {
        let commands = self.call_commands(call_id).await?;
        request(&commands, |reply| RoomCommand::End {
            call_id: *call_id,
            user_id: user_id.clone(),
            reply,
        })
        .await
    }

    /// Room hosting `call_id`. Ended calls stay resolvable for
    /// `ended_call_retention`.
    pub async fn room_of(&self, call_id: &CallId) -> Option<RoomId> {
        self.inner.calls.read().await.get(call_id).cloned()
    }

    async fn room_commands(&self, room_id: &RoomId) -> Result<mpsc::Sender<RoomCommand>, CallError> {
        self.inner
            .rooms
            .read()
            .await
            .get(room_id)
            .map(|h| h.commands.clone())
            .ok_or_else(|| CallError::RoomNotFound(room_id.clone()))
    }

    async fn call_commands(&self, call_id: &CallId) -> Result<mpsc::Sender<RoomCommand>, CallError> {
        let room_id = self
            .room_of(call_id)
            .await
            .ok_or(CallError::CallNotFound(*call_id))?;
        self.room_commands(&room_id).await
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

#[async_trait]
impl SignalingTransport for Coordinator {
    async fn join(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<(JoinResponse, EventStream), CallError> {
        Coordinator::join(self, room_id, user_id).await
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), CallError> {
        self.relay(message).await.map(|_| ())
    }

    async fn leave(&self, call_id: &CallId, user_id: &UserId) -> Result<(), CallError> {
        Coordinator::leave(self, call_id, user_id).await
    }

    async fn end(&self, call_id: &CallId, user_id: &UserId) -> Result<(), CallError> {
        Coordinator::end(self, call_id, user_id).await
    }
}

async fn request<T>(
    commands: &mpsc::Sender<RoomCommand>,
    build: impl FnOnce(Reply<T>) -> RoomCommand,
) -> Result<T, CallError> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(build(tx))
        .await
        .map_err(|_| CallError::CoordinatorUnavailable)?;
    rx.await.map_err(|_| CallError::CoordinatorUnavailable)?
}

// ---------------------------------------------------------------------------
// Room actor
// ---------------------------------------------------------------------------

async fn run_room(
    mut state: RoomState,
    mut commands: mpsc::Receiver<RoomCommand>,
    calls: CallIndex,
    config: CoordinatorConfig,
) {
    let mut sweep = tokio::time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut current = state.active_call();
    let mut retired: VecDeque<(CallId, Instant)> = VecDeque::new();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                handle_command(&mut state, cmd, &calls).await;
            }
            _ = sweep.tick() => {
                let removed = state.sweep(Instant::now());
                if !removed.is_empty() {
                    debug!(room = %state.room_id(), removed = removed.len(), "Liveness sweep");
                }
                forget_ended_calls(&state, &calls, &mut retired, config.ended_call_retention).await;
            }
        }

        let active = state.active_call();
        if active != current {
            if let Some(ended) = current {
                retired.push_back((ended, Instant::now()));
            }
            current = active;
        }
    }

    debug!(room = %state.room_id(), "Room actor stopped");
}

/// Drop index entries of calls that ended more than `retention` ago.
async fn forget_ended_calls(
    state: &RoomState,
    calls: &CallIndex,
    retired: &mut VecDeque<(CallId, Instant)>,
    retention: Duration,
) {
    let now = Instant::now();
    let expired = |ended_at: Instant| now.saturating_duration_since(ended_at) >= retention;
    if !retired.front().is_some_and(|(_, ended_at)| expired(*ended_at)) {
        return;
    }

    let mut index = calls.write().await;
    while let Some(&(call_id, ended_at)) = retired.front() {
        if !expired(ended_at) {
            break;
        }
        retired.pop_front();
        index.remove(&call_id);
        debug!(room = %state.room_id(), call = %call_id, "Forgot ended call");
    }
}

async fn handle_command(state: &mut RoomState, cmd: RoomCommand, calls: &CallIndex) {
    match cmd {
        RoomCommand::Join { user_id, reply } => {
            let result = state.join(user_id, Instant::now());
            if let Ok((response, _, true)) = &result {
                calls
                    .write()
                    .await
                    .insert(response.call_id, state.room_id().clone());
            }
            let _ = reply.send(result.map(|(response, events, _)| (response, events)));
        }
        RoomCommand::Relay { message, reply } => {
            let result = state.relay(message, Instant::now());
            if let Err(e) = &result {
                warn!(room = %state.room_id(), error = %e, "Rejected signaling message");
            }
            let _ = reply.send(result);
        }
        RoomCommand::Leave {
            call_id,
            user_id,
            reply,
        } => {
            if state.active_call() == Some(call_id) {
                state.leave(&user_id, LeaveReason::Left);
            } else {
                debug!(room = %state.room_id(), call = %call_id, peer = %user_id, "Leave for finished call");
            }
            let _ = reply.send(Ok(()));
        }
        RoomCommand::End {
            call_id,
            user_id,
            reply,
        } => {
            let _ = reply.send(state.end(call_id, &user_id).map(|_| ()));
        }
        RoomCommand::Snapshot { reply } => {
            let _ = reply.send(state.snapshot());
        }
    }
}
