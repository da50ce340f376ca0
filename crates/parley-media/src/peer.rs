//! Peer connection manager.
//!
//! One `PeerConnectionManager` per remote participant. It runs the
//! [`PeerLink`] state machine against a [`MediaTransport`], owns the link's
//! timers and turns everything the remote needs to hear into
//! [`PeerNotice::Signal`]s for the call controller to relay. Managers are
//! owned by a single controller task and talk back only through
//! [`PeerEvent`]s on the controller's channel.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::constants::{NEGOTIATION_TIMEOUT_MS, TRACK_SWAP_GRACE_MS};
use parley_shared::{NegotiationState, Signal, TrackId, UserId};

use crate::capture::LocalTrack;
use crate::mixer::{AudioTap, TapSlot};
use crate::negotiation::{LinkAction, LinkReport, PeerLink};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Transport closed")]
    Closed,

    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    /// A local network-path candidate to send to the remote.
    LocalCandidate(String),
    /// First media frame received from the remote.
    MediaStarted,
    TransportFailed,
    TrackSwapAcked(u64),
    NegotiationTimeout(u64),
    SwapTimeout(u64),
}

/// Asynchronous notification from a transport or a link timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub remote: UserId,
    /// Distinguishes a torn-down link's stragglers from its replacement.
    pub link_id: u64,
    pub kind: PeerEventKind,
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Everything a transport needs to set up one link.
pub struct LinkContext {
    pub local: UserId,
    pub remote: UserId,
    pub link_id: u64,
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
    pub events: PeerEventSender,
    /// Where decoded remote audio goes. Empty while nobody records.
    pub remote_audio: TapSlot,
}

impl LinkContext {
    /// Emit an event for this link. A closed controller is ignored.
    pub fn emit(&self, kind: PeerEventKind) {
        emit(&self.events, &self.remote, self.link_id, kind);
    }
}

fn emit(events: &PeerEventSender, remote: &UserId, link_id: u64, kind: PeerEventKind) {
    let _ = events.send(PeerEvent {
        remote: remote.clone(),
        link_id,
        kind,
    });
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError>;

    /// Apply a remote offer and return the local answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError>;

    async fn apply_answer(&self, sdp: &str) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: &str) -> Result<(), TransportError>;

    /// Replace the outgoing video track in place. The transport emits
    /// `TrackSwapAcked(token)` once the remote picks it up.
    async fn replace_video_track(
        &self,
        track: Option<LocalTrack>,
        token: u64,
    ) -> Result<(), TransportError>;

    /// Identity of the audio track currently being sent.
    fn audio_track_id(&self) -> Option<TrackId>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, ctx: LinkContext) -> Result<Box<dyn MediaTransport>, TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PeerTimeouts {
    pub negotiation: Duration,
    pub swap_grace: Duration,
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        Self {
            negotiation: Duration::from_millis(NEGOTIATION_TIMEOUT_MS),
            swap_grace: Duration::from_millis(TRACK_SWAP_GRACE_MS),
        }
    }
}

/// What the controller must act on after driving a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotice {
    /// Relay this signal to the remote.
    Signal(Signal),
    Connected,
    Failed,
}

pub struct PeerConnectionManager {
    remote: UserId,
    link_id: u64,
    link: PeerLink,
    transport: Box<dyn MediaTransport>,
    video: Option<LocalTrack>,
    recording: TapSlot,
    events: PeerEventSender,
    timeouts: PeerTimeouts,
    negotiation_timer: Option<JoinHandle<()>>,
    swap_timer: Option<JoinHandle<()>>,
}

impl PeerConnectionManager {
    /// Open a transport for `ctx.remote` and start negotiating.
    pub async fn open(
        factory: &dyn TransportFactory,
        ctx: LinkContext,
        timeouts: PeerTimeouts,
    ) -> Result<(Self, Vec<PeerNotice>), TransportError> {
        let remote = ctx.remote.clone();
        let link_id = ctx.link_id;
        let video = ctx.video.clone();
        let recording = ctx.remote_audio.clone();
        let events = ctx.events.clone();
        let link = PeerLink::new(ctx.local.clone(), remote.clone());

        let transport = factory.connect(ctx).await?;
        info!(remote = %remote, link = link_id, initiator = link.is_initiator(), "Peer link opened");

        let mut manager = Self {
            remote,
            link_id,
            link,
            transport,
            video,
            recording,
            events,
            timeouts,
            negotiation_timer: None,
            swap_timer: None,
        };
        let actions = manager.link.begin();
        let notices = manager.run(actions).await;
        Ok((manager, notices))
    }

    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn state(&self) -> NegotiationState {
        self.link.state()
    }

    pub fn audio_track_id(&self) -> Option<TrackId> {
        self.transport.audio_track_id()
    }

    /// Route the remote's decoded audio into `tap`, or stop routing it.
    pub fn record_into(&self, tap: Option<AudioTap>) {
        self.recording.set(tap);
    }

    /// Feed a signal received from the remote.
    pub async fn handle_signal(&mut self, signal: Signal) -> Vec<PeerNotice> {
        let actions = match signal {
            Signal::Offer { sdp } => self.link.on_offer(sdp),
            Signal::Answer { sdp } => self.link.on_answer(sdp),
            Signal::Candidate { candidate } => self.link.on_candidate(candidate),
            other => {
                debug!(remote = %self.remote, kind = other.kind(), "Not a negotiation signal");
                Vec::new()
            }
        };
        self.run(actions).await
    }

    /// Feed an event addressed to this link.
    pub async fn handle_event(&mut self, kind: PeerEventKind) -> Vec<PeerNotice> {
        let actions = match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                return vec![PeerNotice::Signal(Signal::Candidate { candidate })];
            }
            PeerEventKind::MediaStarted => self.link.on_media_started(),
            PeerEventKind::TransportFailed => self.link.on_transport_failed(),
            PeerEventKind::TrackSwapAcked(token) => {
                self.link.on_swap_acked(token);
                if let Some(timer) = self.swap_timer.take() {
                    timer.abort();
                }
                Vec::new()
            }
            PeerEventKind::NegotiationTimeout(generation) => self.link.on_timeout(generation),
            PeerEventKind::SwapTimeout(token) => self.link.on_swap_timeout(token),
        };
        self.run(actions).await
    }

    /// Swap the outgoing video track. Audio is never touched.
    pub async fn replace_video(&mut self, track: Option<LocalTrack>) -> Vec<PeerNotice> {
        self.video = track;
        let actions = self.link.begin_swap();
        self.run(actions).await
    }

    pub async fn close(mut self) {
        self.cancel_timers();
        self.transport.close().await;
        info!(remote = %self.remote, link = self.link_id, "Peer link closed");
    }

    async fn run(&mut self, actions: Vec<LinkAction>) -> Vec<PeerNotice> {
        let mut queue: VecDeque<LinkAction> = actions.into();
        let mut notices = Vec::new();

        while let Some(action) = queue.pop_front() {
            match action {
                LinkAction::CreateOffer { ice_restart } => {
                    match self.transport.create_offer(ice_restart).await {
                        Ok(sdp) => notices.push(PeerNotice::Signal(Signal::Offer { sdp })),
                        Err(e) => {
                            warn!(remote = %self.remote, error = %e, "Failed to create offer");
                            queue.extend(self.link.on_transport_failed());
                        }
                    }
                }
                LinkAction::AcceptOffer(offer) => match self.transport.accept_offer(&offer).await {
                    Ok(sdp) => notices.push(PeerNotice::Signal(Signal::Answer { sdp })),
                    Err(e) => {
                        warn!(remote = %self.remote, error = %e, "Failed to answer offer");
                        queue.extend(self.link.on_transport_failed());
                    }
                },
                LinkAction::ApplyAnswer(answer) => {
                    if let Err(e) = self.transport.apply_answer(&answer).await {
                        warn!(remote = %self.remote, error = %e, "Failed to apply answer");
                        queue.extend(self.link.on_transport_failed());
                    }
                }
                LinkAction::AddCandidate(candidate) => {
                    if let Err(e) = self.transport.add_candidate(&candidate).await {
                        debug!(remote = %self.remote, error = %e, "Skipping candidate");
                    }
                }
                LinkAction::ReplaceVideo { token } => {
                    if let Err(e) = self
                        .transport
                        .replace_video_track(self.video.clone(), token)
                        .await
                    {
                        debug!(remote = %self.remote, error = %e, "In-place swap failed");
                        queue.extend(self.link.on_swap_timeout(token));
                    }
                }
                LinkAction::ArmTimer { generation } => {
                    if let Some(timer) = self.negotiation_timer.take() {
                        timer.abort();
                    }
                    self.negotiation_timer = Some(self.spawn_timer(
                        self.timeouts.negotiation,
                        PeerEventKind::NegotiationTimeout(generation),
                    ));
                }
                LinkAction::ArmSwapTimer { token } => {
                    if let Some(timer) = self.swap_timer.take() {
                        timer.abort();
                    }
                    self.swap_timer = Some(
                        self.spawn_timer(self.timeouts.swap_grace, PeerEventKind::SwapTimeout(token)),
                    );
                }
                LinkAction::CancelTimer => {
                    if let Some(timer) = self.negotiation_timer.take() {
                        timer.abort();
                    }
                }
                LinkAction::Report(LinkReport::Connected) => {
                    info!(remote = %self.remote, link = self.link_id, "Peer connected");
                    notices.push(PeerNotice::Connected);
                }
                LinkAction::Report(LinkReport::Failed) => {
                    warn!(remote = %self.remote, link = self.link_id, "Peer negotiation failed");
                    notices.push(PeerNotice::Failed);
                }
            }
        }

        notices
    }

    fn spawn_timer(&self, after: Duration, kind: PeerEventKind) -> JoinHandle<()> {
        let events = self.events.clone();
        let remote = self.remote.clone();
        let link_id = self.link_id;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            emit(&events, &remote, link_id, kind);
        })
    }

    fn cancel_timers(&mut self) {
        for timer in [self.negotiation_timer.take(), self.swap_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        calls: Mutex<Vec<String>>,
        fail_offers: Mutex<bool>,
        remote_audio: Mutex<Option<TapSlot>>,
    }

    struct ScriptedTransport {
        log: Arc<Log>,
        audio: Option<TrackId>,
    }

    #[async_trait]
    impl MediaTransport for ScriptedTransport {
        async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError> {
            self.log.calls.lock().unwrap().push(format!("offer:{ice_restart}"));
            if *self.log.fail_offers.lock().unwrap() {
                return Err(TransportError::WebRtc("boom".into()));
            }
            Ok("local-offer".into())
        }

        async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError> {
            self.log.calls.lock().unwrap().push(format!("accept:{sdp}"));
            Ok("local-answer".into())
        }

        async fn apply_answer(&self, sdp: &str) -> Result<(), TransportError> {
            self.log.calls.lock().unwrap().push(format!("answer:{sdp}"));
            Ok(())
        }

        async fn add_candidate(&self, candidate: &str) -> Result<(), TransportError> {
            self.log.calls.lock().unwrap().push(format!("cand:{candidate}"));
            Ok(())
        }

        async fn replace_video_track(
            &self,
            track: Option<LocalTrack>,
            token: u64,
        ) -> Result<(), TransportError> {
            self.log
                .calls
                .lock()
                .unwrap()
                .push(format!("swap:{}:{token}", track.is_some()));
            Ok(())
        }

        fn audio_track_id(&self) -> Option<TrackId> {
            self.audio
        }

        async fn close(&self) {
            self.log.calls.lock().unwrap().push("close".into());
        }
    }

    struct ScriptedFactory {
        log: Arc<Log>,
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn connect(
            &self,
            ctx: LinkContext,
        ) -> Result<Box<dyn MediaTransport>, TransportError> {
            *self.log.remote_audio.lock().unwrap() = Some(ctx.remote_audio.clone());
            Ok(Box::new(ScriptedTransport {
                log: self.log.clone(),
                audio: ctx.audio.as_ref().map(LocalTrack::id),
            }))
        }
    }

    fn ctx(local: &str, remote: &str, events: PeerEventSender) -> LinkContext {
        LinkContext {
            local: UserId::new(local),
            remote: UserId::new(remote),
            link_id: 1,
            audio: Some(LocalTrack::new(crate::capture::TrackKind::Audio)),
            video: None,
            events,
            remote_audio: TapSlot::default(),
        }
    }

    async fn open(
        local: &str,
        remote: &str,
        timeouts: PeerTimeouts,
    ) -> (
        PeerConnectionManager,
        Vec<PeerNotice>,
        Arc<Log>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let log = Arc::new(Log::default());
        let factory = ScriptedFactory { log: log.clone() };
        let (tx, rx) = mpsc::unbounded_channel();
        let (manager, notices) = PeerConnectionManager::open(&factory, ctx(local, remote, tx), timeouts)
            .await
            .unwrap();
        (manager, notices, log, rx)
    }

    #[tokio::test]
    async fn test_initiator_sends_offer() {
        let (manager, notices, _log, _rx) = open("a", "b", PeerTimeouts::default()).await;
        assert_eq!(
            notices,
            vec![PeerNotice::Signal(Signal::Offer {
                sdp: "local-offer".into()
            })]
        );
        assert_eq!(manager.state(), NegotiationState::OfferSent);
    }

    #[tokio::test]
    async fn test_answerer_applies_offer_before_buffered_candidates() {
        let (mut manager, notices, log, _rx) = open("b", "a", PeerTimeouts::default()).await;
        assert!(notices.is_empty());

        manager
            .handle_signal(Signal::Candidate {
                candidate: "c1".into(),
            })
            .await;
        let notices = manager
            .handle_signal(Signal::Offer { sdp: "remote".into() })
            .await;
        assert_eq!(
            notices,
            vec![PeerNotice::Signal(Signal::Answer {
                sdp: "local-answer".into()
            })]
        );
        assert_eq!(
            *log.calls.lock().unwrap(),
            vec!["accept:remote".to_string(), "cand:c1".to_string()]
        );

        let notices = manager.handle_event(PeerEventKind::MediaStarted).await;
        assert_eq!(notices, vec![PeerNotice::Connected]);
    }

    #[tokio::test]
    async fn test_local_candidate_becomes_signal() {
        let (mut manager, _, _log, _rx) = open("a", "b", PeerTimeouts::default()).await;
        let notices = manager
            .handle_event(PeerEventKind::LocalCandidate("host 1".into()))
            .await;
        assert_eq!(
            notices,
            vec![PeerNotice::Signal(Signal::Candidate {
                candidate: "host 1".into()
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_restart_then_fail() {
        let timeouts = PeerTimeouts {
            negotiation: Duration::from_secs(2),
            ..PeerTimeouts::default()
        };
        let (mut manager, _, log, mut rx) = open("a", "b", timeouts).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, PeerEventKind::NegotiationTimeout(0));
        let notices = manager.handle_event(event.kind).await;
        assert_eq!(
            notices,
            vec![PeerNotice::Signal(Signal::Offer {
                sdp: "local-offer".into()
            })]
        );
        assert!(log.calls.lock().unwrap().contains(&"offer:true".to_string()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, PeerEventKind::NegotiationTimeout(1));
        assert_eq!(manager.handle_event(event.kind).await, vec![PeerNotice::Failed]);
        assert_eq!(manager.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_offer_failure_counts_as_transport_failure() {
        let log = Arc::new(Log::default());
        *log.fail_offers.lock().unwrap() = true;
        let factory = ScriptedFactory { log: log.clone() };
        let (tx, _rx) = mpsc::unbounded_channel();

        let (manager, notices) =
            PeerConnectionManager::open(&factory, ctx("a", "b", tx), PeerTimeouts::default())
                .await
                .unwrap();
        assert_eq!(notices, vec![PeerNotice::Failed]);
        assert_eq!(manager.state(), NegotiationState::Failed);
        assert_eq!(
            *log.calls.lock().unwrap(),
            vec!["offer:false".to_string(), "offer:true".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_swap_renegotiates() {
        let timeouts = PeerTimeouts {
            negotiation: Duration::from_secs(60),
            swap_grace: Duration::from_millis(500),
        };
        let (mut manager, _, log, mut rx) = open("a", "b", timeouts).await;
        manager.handle_signal(Signal::Answer { sdp: "x".into() }).await;
        manager.handle_event(PeerEventKind::MediaStarted).await;
        let audio = manager.audio_track_id();

        let notices = manager.replace_video(None).await;
        assert!(notices.is_empty());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, PeerEventKind::SwapTimeout(1));
        let notices = manager.handle_event(event.kind).await;
        assert!(matches!(notices[..], [PeerNotice::Signal(Signal::Offer { .. })]));
        assert!(log.calls.lock().unwrap().contains(&"swap:false:1".to_string()));
        assert_eq!(manager.audio_track_id(), audio);
    }

    #[tokio::test]
    async fn test_recording_can_attach_after_open() {
        let (manager, _, log, _rx) = open("a", "b", PeerTimeouts::default()).await;
        let slot = log.remote_audio.lock().unwrap().clone().unwrap();
        assert!(!slot.push(vec![0.5]));

        let mut graph = crate::mixer::MixingGraph::new(64);
        manager.record_into(Some(graph.add_input(UserId::new("b"))));
        assert!(slot.push(vec![0.5]));
        assert_eq!(graph.render(1), vec![0.5]);

        manager.record_into(None);
        assert!(!slot.push(vec![0.5]));
    }

    #[tokio::test]
    async fn test_close_closes_transport() {
        let (manager, _, log, _rx) = open("a", "b", PeerTimeouts::default()).await;
        manager.close().await;
        assert_eq!(log.calls.lock().unwrap().last().unwrap(), "close");
    }
}
