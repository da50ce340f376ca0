//! Call lifecycle controller.
//!
//! One actor task per local participant. It owns the media capture, every
//! [`PeerConnectionManager`] and the recording pipeline, and is the only
//! writer of all of them. Everything reaches it as a message: user commands
//! through a [`CallHandle`], coordinator events through the signaling
//! stream, link events through the peer-event channel, plus the heartbeat
//! tick and capture-loss notifications.
//!
//! Under the host recording policy the recorder is whoever holds the host
//! role: a promoted host starts a new recording segment at its offset on
//! the call timeline, so the stored recording spans the whole call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use parley_media::peer::PeerEventSender;
use parley_media::{
    AudioTap, CaptureDevice, DeviceError, LinkContext, LocalTrack, MediaCapture,
    PeerConnectionManager, PeerEvent, PeerNotice, PeerTimeouts, RecordingConfig,
    RecordingPipeline, RecordingSink, RecordingStatus, TapSlot, TrackKind, TrackSwap,
    TransportFactory,
};
use parley_shared::constants::HEARTBEAT_INTERVAL_MS;
use parley_shared::{
    CallId, EndReason, EventStream, JoinResponse, LeaveReason, MediaState, Participant, Role,
    RoomId, ServerEvent, Signal, SignalingMessage, SignalingTransport, UserId,
};

use crate::config::RecordingPolicy;
use crate::error::ClientError;
use crate::events::CallEvent;
use crate::state::{CallSnapshot, CallState, PeerSummary};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub with_video: bool,
    pub heartbeat_interval: Duration,
    pub peer_timeouts: PeerTimeouts,
    pub recording: RecordingPolicy,
    pub recording_config: RecordingConfig,
}

impl ControllerConfig {
    pub fn new(user_id: UserId, room_id: RoomId) -> Self {
        Self {
            user_id,
            room_id,
            with_video: false,
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            peer_timeouts: PeerTimeouts::default(),
            recording: RecordingPolicy::default(),
            recording_config: RecordingConfig::default(),
        }
    }
}

/// Collaborators a controller drives.
#[derive(Clone)]
pub struct CallServices {
    pub signaling: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn TransportFactory>,
    pub device: Arc<dyn CaptureDevice>,
    pub sink: Arc<dyn RecordingSink>,
}

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum Command {
    Join(Reply<JoinResponse>),
    ToggleAudio(Reply<MediaState>),
    ToggleVideo(Reply<MediaState>),
    StartScreenShare(Reply<MediaState>),
    StopScreenShare(Reply<MediaState>),
    Leave(Reply<Option<RecordingStatus>>),
    End(Reply<Option<RecordingStatus>>),
    Snapshot(oneshot::Sender<CallSnapshot>),
}

/// Cheap, cloneable front end of a running controller.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ClientError::ControllerStopped)?;
        rx.await.map_err(|_| ClientError::ControllerStopped)?
    }

    /// Acquire local media and join the configured room.
    pub async fn join(&self) -> Result<JoinResponse, ClientError> {
        self.request(Command::Join).await
    }

    pub async fn toggle_audio(&self) -> Result<MediaState, ClientError> {
        self.request(Command::ToggleAudio).await
    }

    pub async fn toggle_video(&self) -> Result<MediaState, ClientError> {
        self.request(Command::ToggleVideo).await
    }

    pub async fn start_screen_share(&self) -> Result<MediaState, ClientError> {
        self.request(Command::StartScreenShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<MediaState, ClientError> {
        self.request(Command::StopScreenShare).await
    }

    /// Leave the call. Returns the recording outcome when this client
    /// was recording. Leaving twice is a no-op.
    pub async fn leave(&self) -> Result<Option<RecordingStatus>, ClientError> {
        self.request(Command::Leave).await
    }

    /// Host-only: end the call for everyone.
    pub async fn end(&self) -> Result<Option<RecordingStatus>, ClientError> {
        self.request(Command::End).await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| ClientError::ControllerStopped)?;
        rx.await.map_err(|_| ClientError::ControllerStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

pub struct CallController {
    config: ControllerConfig,
    services: CallServices,
    capture: MediaCapture,
    state: CallState,
    call_id: Option<CallId>,
    /// When the call was created, on the local clock.
    call_started: Option<Instant>,
    role: Option<Role>,
    host: Option<UserId>,
    /// Remote participants, advisory copies.
    roster: BTreeMap<UserId, Participant>,
    links: HashMap<UserId, PeerConnectionManager>,
    next_link_id: u64,
    peer_tx: PeerEventSender,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    server_events: Option<EventStream>,
    recording: Option<RecordingPipeline>,
    local_feed: Option<JoinHandle<()>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallController {
    /// Start a controller task. It runs until every [`CallHandle`] is
    /// dropped, leaving the call first if it is still active.
    pub fn spawn(config: ControllerConfig, services: CallServices) -> (CallHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let controller = Self {
            capture: MediaCapture::new(services.device.clone()),
            config,
            services,
            state: CallState::Idle,
            call_id: None,
            call_started: None,
            role: None,
            host: None,
            roster: BTreeMap::new(),
            links: HashMap::new(),
            next_link_id: 0,
            peer_tx,
            peer_rx,
            server_events: None,
            recording: None,
            local_feed: None,
            events: events.clone(),
        };

        let task = tokio::spawn(controller.run(command_rx));
        (
            CallHandle {
                commands: command_tx,
                events,
            },
            task,
        )
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let active = self.state == CallState::Active;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_server_event(&mut self.server_events) => match event {
                    Some(event) => self.handle_server_event(event).await,
                    None => self.on_signaling_lost().await,
                },
                Some(event) = self.peer_rx.recv() => self.handle_peer_event(event).await,
                _ = heartbeat.tick(), if active => self.send_heartbeat().await,
                (kind, error) = self.capture.next_loss(), if active => {
                    self.handle_capability_loss(kind, error).await;
                }
            }
        }

        if self.state == CallState::Active {
            self.teardown(true).await;
        }
        debug!(user = %self.config.user_id, "Call controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join(reply) => {
                let _ = reply.send(self.join().await);
            }
            Command::ToggleAudio(reply) => {
                let _ = reply.send(self.toggle_audio().await);
            }
            Command::ToggleVideo(reply) => {
                let _ = reply.send(self.toggle_video().await);
            }
            Command::StartScreenShare(reply) => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare(reply) => {
                let _ = reply.send(self.stop_screen_share().await);
            }
            Command::Leave(reply) => {
                let _ = reply.send(self.leave().await);
            }
            Command::End(reply) => {
                let _ = reply.send(self.end().await);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    async fn join(&mut self) -> Result<JoinResponse, ClientError> {
        if !self.state.can_join() {
            return Err(ClientError::InvalidState(self.state));
        }
        self.set_state(CallState::Joining);

        for loss in self.capture.start(self.config.with_video).await {
            self.emit(CallEvent::CapabilityLost {
                kind: loss.kind,
                error: loss.error.to_string(),
            });
        }

        let joined = self
            .services
            .signaling
            .join(&self.config.room_id, &self.config.user_id)
            .await;
        let (response, stream) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                warn!(room = %self.config.room_id, error = %e, "Join failed");
                self.capture.stop().await;
                self.set_state(CallState::Idle);
                return Err(e.into());
            }
        };

        info!(
            room = %self.config.room_id,
            call = %response.call_id,
            role = ?response.role,
            roster = response.roster.len(),
            "Joined call"
        );

        self.call_id = Some(response.call_id);
        let now = Instant::now();
        self.call_started = Some(
            now.checked_sub(Duration::from_millis(response.call_age_ms))
                .unwrap_or(now),
        );
        self.role = Some(response.role);
        self.host = response
            .roster
            .iter()
            .find(|p| p.role == Role::Host)
            .map(|p| p.user_id.clone());
        self.server_events = Some(stream);

        if self.should_record(response.role) {
            self.start_recording(response.call_id).await;
        }

        for participant in &response.roster {
            self.add_peer(participant.clone()).await;
        }

        self.set_state(CallState::Active);

        let media = self.capture.media_state();
        if media != MediaState::default() {
            self.broadcast_media_state(media).await;
        }
        Ok(response)
    }

    async fn leave(&mut self) -> Result<Option<RecordingStatus>, ClientError> {
        match self.state {
            CallState::Active => Ok(self.teardown(true).await),
            CallState::Idle | CallState::Ended => Ok(None),
            other => Err(ClientError::InvalidState(other)),
        }
    }

    async fn end(&mut self) -> Result<Option<RecordingStatus>, ClientError> {
        match self.state {
            CallState::Active => {}
            CallState::Idle | CallState::Ended => return Ok(None),
            other => return Err(ClientError::InvalidState(other)),
        }
        let Some(call_id) = self.call_id else {
            return Err(ClientError::InvalidState(self.state));
        };

        self.services
            .signaling
            .end(&call_id, &self.config.user_id)
            .await?;
        info!(call = %call_id, "Call ended by host");
        self.emit(CallEvent::CallEnded(EndReason::EndedByHost));
        Ok(self.teardown(false).await)
    }

    /// Leave the call locally: close every link, release devices, when
    /// `notify` tell the coordinator, then flush the recording. The upload
    /// may retry for a while and must not hold up the departure.
    async fn teardown(&mut self, notify: bool) -> Option<RecordingStatus> {
        self.set_state(CallState::Leaving);

        let links: Vec<_> = self.links.drain().collect();
        for (_, link) in links {
            link.close().await;
        }
        if let Some(feed) = self.local_feed.take() {
            feed.abort();
        }
        self.capture.stop().await;

        if notify {
            if let Some(call_id) = self.call_id {
                if let Err(e) = self
                    .services
                    .signaling
                    .leave(&call_id, &self.config.user_id)
                    .await
                {
                    warn!(call = %call_id, error = %e, "Leave not acknowledged");
                }
            }
        }
        self.server_events = None;

        let status = match self.recording.take() {
            Some(pipeline) => {
                let status = pipeline.finish().await;
                self.emit(CallEvent::RecordingFinished(status.clone()));
                Some(status)
            }
            None => None,
        };

        self.roster.clear();
        self.call_started = None;
        self.role = None;
        self.host = None;
        self.set_state(CallState::Ended);
        status
    }

    async fn on_signaling_lost(&mut self) {
        self.server_events = None;
        if self.state == CallState::Active {
            warn!(user = %self.config.user_id, "Signaling channel lost, leaving call");
            self.teardown(false).await;
        }
    }

    fn set_state(&mut self, next: CallState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Unexpected call state transition");
        }
        debug!(user = %self.config.user_id, from = %self.state, to = %next, "Call state");
        self.state = next;
        self.emit(CallEvent::StateChanged(next));
    }

    fn snapshot(&self) -> CallSnapshot {
        let peers = self
            .roster
            .values()
            .map(|p| {
                let link = self.links.get(&p.user_id);
                PeerSummary {
                    user_id: p.user_id.clone(),
                    role: p.role,
                    media: p.media,
                    link: link.map(PeerConnectionManager::state),
                    audio_track: link.and_then(PeerConnectionManager::audio_track_id),
                }
            })
            .collect();

        CallSnapshot {
            user_id: self.config.user_id.clone(),
            state: self.state,
            call_id: self.call_id,
            role: self.role,
            host: self.host.clone(),
            media: self.capture.media_state(),
            recording: self.recording.is_some(),
            peers,
        }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    fn should_record(&self, role: Role) -> bool {
        match self.config.recording {
            RecordingPolicy::Always => true,
            RecordingPolicy::Host => role == Role::Host,
            RecordingPolicy::Off => false,
        }
    }

    /// Start recording from now on. Links that are already open are
    /// attached as sources.
    async fn start_recording(&mut self, call_id: CallId) {
        let offset = self
            .call_started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let pipeline = RecordingPipeline::start(
            call_id,
            offset,
            self.config.recording_config.clone(),
            self.services.sink.clone(),
        );
        if let Some(track) = self.capture.audio_track().cloned() {
            match pipeline.add_source(self.config.user_id.clone()).await {
                Ok(tap) => self.local_feed = Some(tokio::spawn(feed_tap(track, tap))),
                Err(e) => warn!(error = %e, "Could not record local audio"),
            }
        }
        for (remote, link) in &self.links {
            match pipeline.add_source(remote.clone()).await {
                Ok(tap) => link.record_into(Some(tap)),
                Err(e) => warn!(peer = %remote, error = %e, "Could not record remote audio"),
            }
        }
        self.recording = Some(pipeline);
    }

    async fn drop_recording_source(&self, user_id: &UserId) {
        if let Some(pipeline) = &self.recording {
            pipeline.remove_source(user_id).await;
        }
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    async fn add_peer(&mut self, participant: Participant) {
        let remote = participant.user_id.clone();
        if remote == self.config.user_id || self.roster.contains_key(&remote) {
            return;
        }
        self.roster.insert(remote.clone(), participant);
        self.emit(CallEvent::PeerAdded(remote.clone()));
        self.open_link(remote).await;
    }

    async fn open_link(&mut self, remote: UserId) {
        self.next_link_id += 1;
        let remote_audio = match &self.recording {
            Some(pipeline) => TapSlot::new(pipeline.add_source(remote.clone()).await.ok()),
            None => TapSlot::default(),
        };
        let ctx = LinkContext {
            local: self.config.user_id.clone(),
            remote: remote.clone(),
            link_id: self.next_link_id,
            audio: self.capture.audio_track().cloned(),
            video: self.capture.outgoing_video().cloned(),
            events: self.peer_tx.clone(),
            remote_audio,
        };

        let opened = PeerConnectionManager::open(
            self.services.media.as_ref(),
            ctx,
            self.config.peer_timeouts,
        )
        .await;
        match opened {
            Ok((link, notices)) => {
                self.links.insert(remote.clone(), link);
                self.apply_notices(&remote, notices).await;
            }
            Err(e) => {
                warn!(peer = %remote, error = %e, "Could not open peer link");
                self.drop_recording_source(&remote).await;
                self.emit(CallEvent::PeerFailed(remote));
            }
        }
    }

    async fn remove_peer(&mut self, user_id: &UserId, reason: LeaveReason) {
        if self.roster.remove(user_id).is_none() {
            debug!(peer = %user_id, "Departure of unknown participant");
            return;
        }
        if let Some(link) = self.links.remove(user_id) {
            link.close().await;
        }
        self.drop_recording_source(user_id).await;
        info!(peer = %user_id, ?reason, "Participant left");
        self.emit(CallEvent::PeerRemoved {
            user_id: user_id.clone(),
            reason,
        });
    }

    /// Tear down one link that gave up. The remote stays on the roster as
    /// unreachable until the coordinator reports it gone.
    async fn fail_link(&mut self, remote: &UserId) {
        if let Some(link) = self.links.remove(remote) {
            link.close().await;
        }
        self.drop_recording_source(remote).await;
        self.emit(CallEvent::PeerFailed(remote.clone()));
    }

    async fn apply_notices(&mut self, remote: &UserId, notices: Vec<PeerNotice>) {
        for notice in notices {
            match notice {
                PeerNotice::Signal(signal) => self.send_to(remote, signal).await,
                PeerNotice::Connected => self.emit(CallEvent::PeerConnected(remote.clone())),
                PeerNotice::Failed => self.fail_link(remote).await,
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(link) = self.links.get_mut(&event.remote) else {
            debug!(peer = %event.remote, "Event for a closed link");
            return;
        };
        if link.link_id() != event.link_id {
            debug!(peer = %event.remote, link = event.link_id, "Event for a replaced link");
            return;
        }
        let notices = link.handle_event(event.kind).await;
        self.apply_notices(&event.remote, notices).await;
    }

    async fn swap_video(&mut self, swap: TrackSwap) {
        let remotes: Vec<UserId> = self.links.keys().cloned().collect();
        for remote in remotes {
            if let Some(link) = self.links.get_mut(&remote) {
                let notices = link.replace_video(swap.video.clone()).await;
                self.apply_notices(&remote, notices).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Coordinator events
    // -----------------------------------------------------------------------

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ParticipantJoined { participant } => {
                if self.state == CallState::Active {
                    self.add_peer(participant).await;
                }
            }
            ServerEvent::ParticipantLeft { user_id, reason } => {
                if user_id == self.config.user_id {
                    warn!(?reason, "Removed from the call by the coordinator");
                    self.teardown(false).await;
                } else {
                    self.remove_peer(&user_id, reason).await;
                }
            }
            ServerEvent::HostChanged { user_id } => {
                for participant in self.roster.values_mut() {
                    participant.role = if participant.user_id == user_id {
                        Role::Host
                    } else {
                        Role::Participant
                    };
                }
                let promoted = user_id == self.config.user_id;
                if promoted {
                    info!("Promoted to host");
                    self.role = Some(Role::Host);
                }
                self.host = Some(user_id.clone());
                self.emit(CallEvent::HostChanged(user_id));

                if promoted && self.state == CallState::Active && self.recording.is_none() {
                    if let (true, Some(call_id)) = (self.should_record(Role::Host), self.call_id) {
                        info!(call = %call_id, "Taking over the call recording");
                        self.start_recording(call_id).await;
                    }
                }
            }
            ServerEvent::Signal { message } => self.handle_signal(message).await,
            ServerEvent::CallEnded { call_id, reason } => {
                if Some(call_id) == self.call_id && self.state == CallState::Active {
                    info!(call = %call_id, ?reason, "Call ended");
                    self.emit(CallEvent::CallEnded(reason));
                    self.teardown(false).await;
                }
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        if Some(message.call_id) != self.call_id {
            debug!(call = %message.call_id, "Signal for another call");
            return;
        }
        let sender = message.sender;
        match message.payload {
            Signal::MediaState(media) => {
                if let Some(participant) = self.roster.get_mut(&sender) {
                    participant.media = media;
                }
                self.emit(CallEvent::RemoteMediaChanged {
                    user_id: sender,
                    media,
                });
            }
            payload @ (Signal::Offer { .. } | Signal::Answer { .. } | Signal::Candidate { .. }) => {
                let Some(link) = self.links.get_mut(&sender) else {
                    debug!(peer = %sender, kind = payload.kind(), "No link for signal");
                    return;
                };
                let notices = link.handle_signal(payload).await;
                self.apply_notices(&sender, notices).await;
            }
            other => debug!(peer = %sender, kind = other.kind(), "Ignoring relayed signal"),
        }
    }

    // -----------------------------------------------------------------------
    // Local media
    // -----------------------------------------------------------------------

    fn require_active(&self) -> Result<(), ClientError> {
        if self.state == CallState::Active {
            Ok(())
        } else {
            Err(ClientError::InvalidState(self.state))
        }
    }

    async fn toggle_audio(&mut self) -> Result<MediaState, ClientError> {
        self.require_active()?;
        let media = self
            .capture
            .toggle_audio()
            .ok_or(DeviceError::NoDevice(TrackKind::Audio))?;
        self.publish_media(media).await;
        Ok(media)
    }

    async fn toggle_video(&mut self) -> Result<MediaState, ClientError> {
        self.require_active()?;
        match self.capture.toggle_video().await {
            Ok(swap) => {
                if let Some(swap) = swap {
                    self.swap_video(swap).await;
                }
                let media = self.capture.media_state();
                self.publish_media(media).await;
                Ok(media)
            }
            Err(e) => {
                self.report_device_error(TrackKind::Camera, &e);
                Err(e.into())
            }
        }
    }

    async fn start_screen_share(&mut self) -> Result<MediaState, ClientError> {
        self.require_active()?;
        match self.capture.start_screen_share().await {
            Ok(swap) => {
                self.swap_video(swap).await;
                let media = self.capture.media_state();
                self.publish_media(media).await;
                Ok(media)
            }
            Err(e) => {
                self.report_device_error(TrackKind::Screen, &e);
                Err(e.into())
            }
        }
    }

    async fn stop_screen_share(&mut self) -> Result<MediaState, ClientError> {
        self.require_active()?;
        if let Some(swap) = self.capture.stop_screen_share().await {
            self.swap_video(swap).await;
            let media = self.capture.media_state();
            self.publish_media(media).await;
        }
        Ok(self.capture.media_state())
    }

    async fn handle_capability_loss(&mut self, kind: TrackKind, error: DeviceError) {
        self.report_device_error(kind, &error);
        if let Some(swap) = self.capture.handle_loss(kind).await {
            self.swap_video(swap).await;
        }
        if kind == TrackKind::Audio {
            if let Some(feed) = self.local_feed.take() {
                feed.abort();
            }
            let local = self.config.user_id.clone();
            self.drop_recording_source(&local).await;
        }
        let media = self.capture.media_state();
        self.publish_media(media).await;
    }

    fn report_device_error(&self, kind: TrackKind, error: &DeviceError) {
        warn!(kind = %kind, error = %error, "Capture unavailable, continuing without it");
        self.emit(CallEvent::CapabilityLost {
            kind,
            error: error.to_string(),
        });
    }

    async fn publish_media(&mut self, media: MediaState) {
        self.emit(CallEvent::LocalMediaChanged(media));
        self.broadcast_media_state(media).await;
    }

    // -----------------------------------------------------------------------
    // Outbound signaling
    // -----------------------------------------------------------------------

    async fn send_to(&self, remote: &UserId, signal: Signal) {
        let Some(call_id) = self.call_id else { return };
        let message =
            SignalingMessage::to(call_id, self.config.user_id.clone(), remote.clone(), signal);
        if let Err(e) = self.services.signaling.send(message).await {
            debug!(peer = %remote, error = %e, "Signal not relayed");
        }
    }

    async fn broadcast(&self, signal: Signal) -> Result<(), ClientError> {
        let Some(call_id) = self.call_id else {
            return Err(ClientError::InvalidState(self.state));
        };
        let message = SignalingMessage::broadcast(call_id, self.config.user_id.clone(), signal);
        self.services.signaling.send(message).await?;
        Ok(())
    }

    async fn broadcast_media_state(&self, media: MediaState) {
        if let Err(e) = self.broadcast(Signal::MediaState(media)).await {
            warn!(error = %e, "Media state not broadcast");
        }
    }

    async fn send_heartbeat(&self) {
        if let Err(e) = self.broadcast(Signal::Heartbeat).await {
            warn!(error = %e, "Heartbeat failed");
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_server_event(events: &mut Option<EventStream>) -> Option<ServerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Copy local microphone frames into the recording.
async fn feed_tap(track: LocalTrack, tap: AudioTap) {
    let mut frames = track.subscribe();
    loop {
        match frames.recv().await {
            Ok(frame) => {
                tap.push(frame);
            }
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Local recording feed lagging"),
            Err(RecvError::Closed) => break,
        }
        if tap.is_closed() {
            break;
        }
    }
}
