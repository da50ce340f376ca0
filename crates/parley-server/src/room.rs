//! Per-room call state.
//!
//! `RoomState` is the single writer for its room's `CallSession` and roster.
//! It is plain synchronous code driven by the room actor in
//! [`crate::coordinator`], so every transition is testable without a runtime.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_shared::{
    CallError, CallId, CallSession, CallStatus, ConnectionStatus, EndReason, EventStream,
    JoinResponse, LeaveReason, MediaState, Participant, Role, RoomId, RoomSnapshot, ServerEvent,
    Signal, SignalingMessage, UserId,
};

struct Member {
    participant: Participant,
    last_seen: Instant,
    join_seq: u64,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Member {
    fn push(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!(
                peer = %self.participant.user_id,
                "Event channel closed, participant will time out"
            );
        }
    }
}

/// What `relay` did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forwarded to this many participants.
    Delivered(usize),
    /// Dropped without error (race or malformed envelope).
    Dropped(&'static str),
    /// The envelope was a heartbeat.
    Heartbeat,
    /// The envelope was a leave.
    Left(LeaveOutcome),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// False when the user was already gone.
    pub removed: bool,
    /// Set when this departure ended the call.
    pub ended: Option<CallId>,
}

pub struct RoomState {
    room_id: RoomId,
    call: Option<CallSession>,
    call_started: Instant,
    members: HashMap<UserId, Member>,
    liveness_window: Duration,
    max_participants: usize,
    next_seq: u64,
}

impl RoomState {
    pub fn new(room_id: RoomId, liveness_window: Duration, max_participants: usize) -> Self {
        Self {
            room_id,
            call: None,
            call_started: Instant::now(),
            members: HashMap::new(),
            liveness_window,
            max_participants,
            next_seq: 0,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The current call, if one is forming or active.
    pub fn active_call(&self) -> Option<CallId> {
        self.call
            .as_ref()
            .filter(|c| c.status != CallStatus::Ended)
            .map(|c| c.call_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Add `user_id` to the room's call, creating a new call when none is
    /// live. Returns the join response, the user's event stream, and whether
    /// a new call was created.
    pub fn join(
        &mut self,
        user_id: UserId,
        now: Instant,
    ) -> Result<(JoinResponse, EventStream, bool), CallError> {
        if self.members.contains_key(&user_id) {
            return Err(CallError::AlreadyJoined(user_id));
        }
        if self.max_participants > 0 && self.members.len() >= self.max_participants {
            return Err(CallError::RoomFull(self.room_id.clone()));
        }

        let created = self.active_call().is_none();
        if created {
            let session = CallSession {
                call_id: CallId::new(),
                room_id: self.room_id.clone(),
                created_at: Utc::now(),
                ended_at: None,
                status: CallStatus::Forming,
            };
            info!(room = %self.room_id, call = %session.call_id, "Call session created");
            self.call = Some(session);
            self.call_started = now;
        }

        let role = if self.members.is_empty() {
            Role::Host
        } else {
            Role::Participant
        };
        let participant = Participant {
            user_id: user_id.clone(),
            role,
            media: MediaState::default(),
            status: ConnectionStatus::Connecting,
            joined_at: Utc::now(),
        };

        for member in self.members.values() {
            member.push(ServerEvent::ParticipantJoined {
                participant: participant.clone(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.members.insert(
            user_id.clone(),
            Member {
                participant,
                last_seen: now,
                join_seq: self.next_seq,
                events: tx,
            },
        );
        self.next_seq += 1;

        let Some(call) = self.call.as_mut() else {
            return Err(CallError::CallNotFound(CallId::default()));
        };
        if call.status == CallStatus::Forming {
            call.status = CallStatus::Active;
        }
        let call_id = call.call_id;

        info!(
            room = %self.room_id,
            call = %call_id,
            peer = %user_id,
            participants = self.members.len(),
            "Participant joined"
        );

        Ok((
            JoinResponse {
                call_id,
                role,
                roster: self.roster(),
                call_age_ms: now.saturating_duration_since(self.call_started).as_millis() as u64,
            },
            rx,
            created,
        ))
    }

    /// Validate and route one envelope.
    pub fn relay(
        &mut self,
        message: SignalingMessage,
        now: Instant,
    ) -> Result<RelayOutcome, CallError> {
        if self.active_call() != Some(message.call_id)
            || !self.members.contains_key(&message.sender)
        {
            return Err(CallError::NotAParticipant(message.sender));
        }

        if !message.is_well_formed() {
            warn!(
                room = %self.room_id,
                from = %message.sender,
                kind = message.payload.kind(),
                "Dropping malformed signaling message"
            );
            return Ok(RelayOutcome::Dropped("malformed"));
        }

        match &message.payload {
            Signal::Heartbeat => {
                self.heartbeat(&message.sender, now)?;
                Ok(RelayOutcome::Heartbeat)
            }
            Signal::Leave => Ok(RelayOutcome::Left(
                self.leave(&message.sender, LeaveReason::Left),
            )),
            Signal::MediaState(state) => {
                let state = *state;
                if let Some(member) = self.members.get_mut(&message.sender) {
                    member.participant.media = state;
                }
                let mut delivered = 0;
                for (user, member) in &self.members {
                    if *user != message.sender {
                        member.push(ServerEvent::Signal {
                            message: message.clone(),
                        });
                        delivered += 1;
                    }
                }
                Ok(RelayOutcome::Delivered(delivered))
            }
            Signal::Offer { .. } | Signal::Answer { .. } | Signal::Candidate { .. } => {
                let Some(target) = message.target.as_ref() else {
                    return Ok(RelayOutcome::Dropped("malformed"));
                };
                match self.members.get(target) {
                    Some(member) => {
                        member.push(ServerEvent::Signal {
                            message: message.clone(),
                        });
                        Ok(RelayOutcome::Delivered(1))
                    }
                    None => {
                        debug!(
                            room = %self.room_id,
                            from = %message.sender,
                            to = %target,
                            kind = message.payload.kind(),
                            "Target already left, dropping message"
                        );
                        Ok(RelayOutcome::Dropped("target departed"))
                    }
                }
            }
        }
    }

    /// Reset the liveness timer of `user_id`.
    pub fn heartbeat(&mut self, user_id: &UserId, now: Instant) -> Result<(), CallError> {
        let member = self
            .members
            .get_mut(user_id)
            .ok_or_else(|| CallError::NotAParticipant(user_id.clone()))?;
        member.last_seen = now;
        if member.participant.status != ConnectionStatus::Connected {
            debug!(room = %self.room_id, peer = %user_id, "Participant connected");
            member.participant.status = ConnectionStatus::Connected;
        }
        Ok(())
    }

    /// Remove `user_id`. Idempotent: a second call reports `removed: false`.
    pub fn leave(&mut self, user_id: &UserId, reason: LeaveReason) -> LeaveOutcome {
        let Some(mut member) = self.members.remove(user_id) else {
            return LeaveOutcome::default();
        };
        member.participant.status = ConnectionStatus::Disconnected;

        info!(
            room = %self.room_id,
            peer = %user_id,
            reason = ?reason,
            participants = self.members.len(),
            "Participant left"
        );

        for other in self.members.values() {
            other.push(ServerEvent::ParticipantLeft {
                user_id: user_id.clone(),
                reason,
            });
        }

        if self.members.is_empty() {
            let ended = self.finish_call(EndReason::LastParticipantLeft);
            return LeaveOutcome {
                removed: true,
                ended,
            };
        }

        if member.participant.role == Role::Host {
            self.promote_host();
        }

        LeaveOutcome {
            removed: true,
            ended: None,
        }
    }

    /// Host-only force end of `call_id`. Returns `Ok(false)` when the call is
    /// already over.
    pub fn end(&mut self, call_id: CallId, user_id: &UserId) -> Result<bool, CallError> {
        if self.active_call() != Some(call_id) {
            return Ok(false);
        }
        let is_host = self
            .members
            .get(user_id)
            .is_some_and(|m| m.participant.role == Role::Host);
        if !is_host {
            return Err(CallError::Forbidden(format!(
                "{user_id} is not the host of call {call_id}"
            )));
        }

        for member in self.members.values() {
            member.push(ServerEvent::CallEnded {
                call_id,
                reason: EndReason::EndedByHost,
            });
        }
        self.members.clear();
        self.finish_call(EndReason::EndedByHost);
        Ok(true)
    }

    /// Check every liveness timer. Returns the users removed for silence.
    pub fn sweep(&mut self, now: Instant) -> Vec<UserId> {
        let half_window = self.liveness_window / 2;
        let mut expired = Vec::new();

        for (user, member) in self.members.iter_mut() {
            let silent = now.saturating_duration_since(member.last_seen);
            if silent > self.liveness_window {
                expired.push(user.clone());
            } else if silent > half_window
                && member.participant.status == ConnectionStatus::Connected
            {
                debug!(room = %self.room_id, peer = %user, "Participant missed heartbeats");
                member.participant.status = ConnectionStatus::Reconnecting;
            }
        }

        for user in &expired {
            warn!(room = %self.room_id, peer = %user, "Heartbeat timeout, removing participant");
            self.leave(user, LeaveReason::TimedOut);
        }
        expired
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            call: self.call.clone(),
            participants: self.roster(),
        }
    }

    fn roster(&self) -> Vec<Participant> {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_by_key(|m| m.join_seq);
        members.into_iter().map(|m| m.participant.clone()).collect()
    }

    fn promote_host(&mut self) {
        let Some(next) = self
            .members
            .values_mut()
            .min_by_key(|m| m.join_seq)
        else {
            return;
        };
        next.participant.role = Role::Host;
        let user_id = next.participant.user_id.clone();
        info!(room = %self.room_id, peer = %user_id, "Host role transferred");

        for member in self.members.values() {
            member.push(ServerEvent::HostChanged {
                user_id: user_id.clone(),
            });
        }
    }

    fn finish_call(&mut self, reason: EndReason) -> Option<CallId> {
        let call = self.call.as_mut()?;
        if call.status == CallStatus::Ended {
            return None;
        }
        call.status = CallStatus::Ended;
        call.ended_at = Some(Utc::now());
        info!(room = %self.room_id, call = %call.call_id, reason = ?reason, "Call ended");
        Some(call.call_id)
    }
}
