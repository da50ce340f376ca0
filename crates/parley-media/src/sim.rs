//! In-process media: a loopback network of peer transports and a tone
//! generator standing in for the microphone.
//!
//! Every [`SimTransport`] registers in a shared [`SimNetwork`] under its
//! `(local, remote)` pair. Media "starts" on a link once the remote
//! description is applied and at least one remote candidate has arrived;
//! from then on the remote side's audio frames are forwarded into the
//! link's recording tap. Pairs can be severed to exercise restart and
//! failure paths.

use std::collections::{HashMap, HashSet};
use std::f32::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use parley_shared::constants::{AUDIO_FRAME_MS, AUDIO_SAMPLE_RATE};
use parley_shared::{TrackId, UserId};

use crate::capture::{CaptureDevice, DeviceError, LocalTrack, TrackKind};
use crate::mixer::TapSlot;
use crate::peer::{
    LinkContext, MediaTransport, PeerEventKind, PeerEventSender, TransportError, TransportFactory,
};

type Pair = (UserId, UserId);

fn unordered(a: &UserId, b: &UserId) -> Pair {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

struct Endpoint {
    link_id: u64,
    audio: Option<LocalTrack>,
    events: PeerEventSender,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<Pair, Endpoint>,
    severed: HashSet<Pair>,
    offers: HashMap<Pair, u32>,
    video: HashMap<Pair, Option<TrackId>>,
    closed: HashMap<Pair, u32>,
    frozen_swaps: bool,
}

/// Shared registry of every simulated link.
#[derive(Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cut the path between `a` and `b`. Both ends see a transport failure
    /// and no media flows until [`heal`](Self::heal).
    pub fn sever(&self, a: &UserId, b: &UserId) {
        let mut state = self.lock();
        state.severed.insert(unordered(a, b));
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(endpoint) = state.endpoints.get(&(local.clone(), remote.clone())) {
                let _ = endpoint.events.send(crate::peer::PeerEvent {
                    remote: remote.clone(),
                    link_id: endpoint.link_id,
                    kind: PeerEventKind::TransportFailed,
                });
            }
        }
        info!(a = %a, b = %b, "Simulated path severed");
    }

    /// Restore the path between `a` and `b`. Links already failed stay
    /// failed; the next restart on the pair can bring media back.
    pub fn heal(&self, a: &UserId, b: &UserId) {
        self.lock().severed.remove(&unordered(a, b));
        info!(a = %a, b = %b, "Simulated path healed");
    }

    /// Acknowledge in-place video swaps (the default) or leave them hanging.
    pub fn set_frozen_swaps(&self, frozen: bool) {
        self.lock().frozen_swaps = frozen;
    }

    /// Offers `local` has created towards `remote`, restarts included.
    pub fn offer_count(&self, local: &UserId, remote: &UserId) -> u32 {
        self.lock()
            .offers
            .get(&(local.clone(), remote.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Video track `local` is currently sending to `remote`.
    pub fn video_track(&self, local: &UserId, remote: &UserId) -> Option<TrackId> {
        self.lock()
            .video
            .get(&(local.clone(), remote.clone()))
            .copied()
            .flatten()
    }

    /// Links `local` has closed towards `remote`.
    pub fn closed_count(&self, local: &UserId, remote: &UserId) -> u32 {
        self.lock()
            .closed
            .get(&(local.clone(), remote.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Whether `local` has a live link towards `remote`.
    pub fn is_linked(&self, local: &UserId, remote: &UserId) -> bool {
        self.lock()
            .endpoints
            .contains_key(&(local.clone(), remote.clone()))
    }

    fn is_severed(&self, a: &UserId, b: &UserId) -> bool {
        self.lock().severed.contains(&unordered(a, b))
    }

    fn remote_audio(&self, local: &UserId, remote: &UserId) -> Option<LocalTrack> {
        self.lock()
            .endpoints
            .get(&(remote.clone(), local.clone()))
            .and_then(|e| e.audio.clone())
    }
}

#[async_trait]
impl TransportFactory for SimNetwork {
    async fn connect(&self, ctx: LinkContext) -> Result<Box<dyn MediaTransport>, TransportError> {
        let key = (ctx.local.clone(), ctx.remote.clone());
        {
            let mut state = self.lock();
            state.endpoints.insert(
                key.clone(),
                Endpoint {
                    link_id: ctx.link_id,
                    audio: ctx.audio.clone(),
                    events: ctx.events.clone(),
                },
            );
            state
                .video
                .insert(key, ctx.video.as_ref().map(LocalTrack::id));
        }
        Ok(Box::new(SimTransport {
            network: self.clone(),
            link: Mutex::new(LinkState::default()),
            ctx,
        }))
    }
}

#[derive(Default)]
struct LinkState {
    remote_description: bool,
    candidates: u32,
    started: bool,
    generation: u32,
    forwarder: Option<JoinHandle<()>>,
}

pub struct SimTransport {
    network: SimNetwork,
    ctx: LinkContext,
    link: Mutex<LinkState>,
}

impl SimTransport {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn restart(&self) {
        let mut link = self.link();
        link.generation += 1;
        link.remote_description = false;
        link.candidates = 0;
        link.started = false;
        if let Some(forwarder) = link.forwarder.take() {
            forwarder.abort();
        }
    }

    fn emit_candidate(&self) {
        let generation = self.link().generation;
        self.ctx.emit(PeerEventKind::LocalCandidate(format!(
            "sim-candidate {} gen={generation}",
            self.ctx.local
        )));
    }

    /// Start media once both the description and a candidate are in.
    fn maybe_start(&self) {
        let mut link = self.link();
        if link.started || !link.remote_description || link.candidates == 0 {
            return;
        }
        if self.network.is_severed(&self.ctx.local, &self.ctx.remote) {
            return;
        }
        link.started = true;

        if let Some(track) = self.network.remote_audio(&self.ctx.local, &self.ctx.remote) {
            link.forwarder = Some(tokio::spawn(forward(track, self.ctx.remote_audio.clone())));
        }
        debug!(local = %self.ctx.local, remote = %self.ctx.remote, "Simulated media started");
        self.ctx.emit(PeerEventKind::MediaStarted);
    }
}

async fn forward(track: LocalTrack, slot: TapSlot) {
    let mut frames = track.subscribe();
    loop {
        match frames.recv().await {
            Ok(frame) => {
                slot.push(frame);
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

#[async_trait]
impl MediaTransport for SimTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError> {
        if ice_restart {
            self.restart();
        }
        *self
            .network
            .lock()
            .offers
            .entry((self.ctx.local.clone(), self.ctx.remote.clone()))
            .or_default() += 1;
        self.emit_candidate();
        Ok(format!(
            "sim-offer {}->{} restart={ice_restart}",
            self.ctx.local, self.ctx.remote
        ))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError> {
        if !sdp.starts_with("sim-offer") {
            return Err(TransportError::InvalidDescription(sdp.to_string()));
        }
        if sdp.ends_with("restart=true") {
            self.restart();
        }
        self.link().remote_description = true;
        self.emit_candidate();
        self.maybe_start();
        Ok(format!("sim-answer {}->{}", self.ctx.local, self.ctx.remote))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), TransportError> {
        if !sdp.starts_with("sim-answer") {
            return Err(TransportError::InvalidDescription(sdp.to_string()));
        }
        self.link().remote_description = true;
        self.maybe_start();
        Ok(())
    }

    async fn add_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        if !candidate.starts_with("sim-candidate") {
            return Err(TransportError::InvalidCandidate(candidate.to_string()));
        }
        self.link().candidates += 1;
        self.maybe_start();
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: Option<LocalTrack>,
        token: u64,
    ) -> Result<(), TransportError> {
        let frozen = {
            let mut state = self.network.lock();
            state.video.insert(
                (self.ctx.local.clone(), self.ctx.remote.clone()),
                track.as_ref().map(LocalTrack::id),
            );
            state.frozen_swaps
        };
        if !frozen {
            self.ctx.emit(PeerEventKind::TrackSwapAcked(token));
        }
        Ok(())
    }

    fn audio_track_id(&self) -> Option<TrackId> {
        self.ctx.audio.as_ref().map(LocalTrack::id)
    }

    async fn close(&self) {
        if let Some(forwarder) = self.link().forwarder.take() {
            forwarder.abort();
        }
        let key = (self.ctx.local.clone(), self.ctx.remote.clone());
        let mut state = self.network.lock();
        *state.closed.entry(key.clone()).or_default() += 1;
        if state
            .endpoints
            .get(&key)
            .is_some_and(|e| e.link_id == self.ctx.link_id)
        {
            state.endpoints.remove(&key);
            state.video.remove(&key);
        }
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        if let Some(forwarder) = self.link().forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Capture device producing a sine tone on the audio track.
pub struct ToneDevice {
    frequency: f32,
    sample_rate: u32,
    denied: Mutex<HashSet<TrackKind>>,
    tracks: Mutex<HashMap<TrackId, (LocalTrack, Option<JoinHandle<()>>)>>,
}

impl ToneDevice {
    pub fn new(frequency: f32) -> Self {
        Self::with_sample_rate(frequency, AUDIO_SAMPLE_RATE)
    }

    pub fn with_sample_rate(frequency: f32, sample_rate: u32) -> Self {
        Self {
            frequency,
            sample_rate,
            denied: Mutex::new(HashSet::new()),
            tracks: Mutex::new(HashMap::new()),
        }
    }

    /// Refuse to open `kind` from now on.
    pub fn deny(&self, kind: TrackKind) {
        self.denied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind);
    }

    /// Simulate `kind` disappearing mid-call.
    pub fn unplug(&self, kind: TrackKind) {
        let tracks = self.tracks.lock().unwrap_or_else(|e| e.into_inner());
        for (track, _) in tracks.values().filter(|(t, _)| t.kind() == kind) {
            track.fail(DeviceError::Disconnected(kind));
        }
    }

    /// Tracks currently open.
    pub fn open_tracks(&self) -> usize {
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl CaptureDevice for ToneDevice {
    async fn open(&self, kind: TrackKind) -> Result<LocalTrack, DeviceError> {
        if self
            .denied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&kind)
        {
            return Err(DeviceError::PermissionDenied(kind));
        }

        let track = LocalTrack::new(kind);
        let generator = (kind == TrackKind::Audio).then(|| {
            tokio::spawn(generate_tone(
                track.clone(),
                self.frequency,
                self.sample_rate,
            ))
        });
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(track.id(), (track.clone(), generator));
        Ok(track)
    }

    async fn release(&self, track: &LocalTrack) {
        let removed = self
            .tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&track.id());
        if let Some((_, Some(generator))) = removed {
            generator.abort();
        }
    }
}

async fn generate_tone(track: LocalTrack, frequency: f32, sample_rate: u32) {
    let frame_len = (sample_rate * AUDIO_FRAME_MS / 1000) as usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(AUDIO_FRAME_MS as u64));
    let mut n: u64 = 0;
    loop {
        ticker.tick().await;
        let frame = (0..frame_len)
            .map(|i| {
                let t = (n + i as u64) as f32 / sample_rate as f32;
                0.3 * (2.0 * PI * frequency * t).sin()
            })
            .collect();
        n += frame_len as u64;
        track.push(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::MixingGraph;
    use crate::peer::PeerEvent;
    use tokio::sync::mpsc;

    fn uid(s: &str) -> UserId {
        UserId::new(s)
    }

    fn context(
        local: &str,
        remote: &str,
        audio: Option<LocalTrack>,
        tap: TapSlot,
    ) -> (LinkContext, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LinkContext {
                local: uid(local),
                remote: uid(remote),
                link_id: 1,
                audio,
                video: None,
                events: tx,
                remote_audio: tap,
            },
            rx,
        )
    }

    fn kinds(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEventKind> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.kind);
        }
        out
    }

    #[tokio::test]
    async fn test_media_starts_after_description_and_candidate() {
        let net = SimNetwork::new();
        let (ctx_a, mut rx_a) = context("a", "b", None, TapSlot::default());
        let (ctx_b, mut rx_b) = context("b", "a", None, TapSlot::default());
        let a = net.connect(ctx_a).await.unwrap();
        let b = net.connect(ctx_b).await.unwrap();

        let offer = a.create_offer(false).await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.apply_answer(&answer).await.unwrap();
        assert!(!kinds(&mut rx_a).contains(&PeerEventKind::MediaStarted));

        a.add_candidate("sim-candidate b gen=0").await.unwrap();
        b.add_candidate("sim-candidate a gen=0").await.unwrap();
        assert!(kinds(&mut rx_a).contains(&PeerEventKind::MediaStarted));
        assert!(kinds(&mut rx_b).contains(&PeerEventKind::MediaStarted));
        assert_eq!(net.offer_count(&uid("a"), &uid("b")), 1);
    }

    #[tokio::test]
    async fn test_severed_link_fails_and_stays_silent() {
        let net = SimNetwork::new();
        let (ctx_a, mut rx_a) = context("a", "b", None, TapSlot::default());
        let a = net.connect(ctx_a).await.unwrap();

        net.sever(&uid("a"), &uid("b"));
        assert_eq!(kinds(&mut rx_a), vec![PeerEventKind::TransportFailed]);

        a.create_offer(true).await.unwrap();
        a.apply_answer("sim-answer b->a").await.unwrap();
        a.add_candidate("sim-candidate b gen=1").await.unwrap();
        assert!(!kinds(&mut rx_a).contains(&PeerEventKind::MediaStarted));
    }

    #[tokio::test]
    async fn test_healed_link_restarts() {
        let net = SimNetwork::new();
        let (ctx_a, mut rx_a) = context("a", "b", None, TapSlot::default());
        let a = net.connect(ctx_a).await.unwrap();

        net.sever(&uid("a"), &uid("b"));
        net.heal(&uid("a"), &uid("b"));
        assert_eq!(kinds(&mut rx_a), vec![PeerEventKind::TransportFailed]);

        a.create_offer(true).await.unwrap();
        a.apply_answer("sim-answer b->a").await.unwrap();
        a.add_candidate("sim-candidate b gen=1").await.unwrap();
        assert!(kinds(&mut rx_a).contains(&PeerEventKind::MediaStarted));
    }

    #[tokio::test]
    async fn test_remote_audio_is_forwarded_into_tap() {
        let net = SimNetwork::new();
        let mut graph = MixingGraph::new(1024);
        let tap = graph.add_input(uid("b"));
        let b_audio = LocalTrack::new(TrackKind::Audio);

        let (ctx_a, _rx_a) = context("a", "b", None, TapSlot::new(Some(tap)));
        let (ctx_b, _rx_b) = context("b", "a", Some(b_audio.clone()), TapSlot::default());
        let a = net.connect(ctx_a).await.unwrap();
        let _b = net.connect(ctx_b).await.unwrap();

        a.create_offer(false).await.unwrap();
        a.apply_answer("sim-answer b->a").await.unwrap();
        a.add_candidate("sim-candidate b gen=0").await.unwrap();
        tokio::task::yield_now().await;

        b_audio.push(vec![0.5; 4]);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(graph.render(4), vec![0.5; 4]);
    }

    #[tokio::test]
    async fn test_swap_ack_can_be_frozen() {
        let net = SimNetwork::new();
        let (ctx, mut rx) = context("a", "b", None, TapSlot::default());
        let a = net.connect(ctx).await.unwrap();
        let camera = LocalTrack::new(TrackKind::Camera);

        a.replace_video_track(Some(camera.clone()), 1).await.unwrap();
        assert_eq!(kinds(&mut rx), vec![PeerEventKind::TrackSwapAcked(1)]);
        assert_eq!(net.video_track(&uid("a"), &uid("b")), Some(camera.id()));

        net.set_frozen_swaps(true);
        a.replace_video_track(None, 2).await.unwrap();
        assert!(kinds(&mut rx).is_empty());
        assert_eq!(net.video_track(&uid("a"), &uid("b")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tone_device_generates_frames_until_released() {
        let device = ToneDevice::with_sample_rate(440.0, 8_000);
        let track = device.open(TrackKind::Audio).await.unwrap();
        let mut frames = track.subscribe();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.len(), 160);
        assert!(frame.iter().any(|s| s.abs() > 0.1));

        device.release(&track).await;
        assert_eq!(device.open_tracks(), 0);
    }

    #[tokio::test]
    async fn test_tone_device_denial_and_unplug() {
        let device = ToneDevice::new(440.0);
        device.deny(TrackKind::Camera);
        assert_eq!(
            device.open(TrackKind::Camera).await.unwrap_err(),
            DeviceError::PermissionDenied(TrackKind::Camera)
        );

        let screen = device.open(TrackKind::Screen).await.unwrap();
        device.unplug(TrackKind::Screen);
        assert_eq!(
            screen.failed().await,
            DeviceError::Disconnected(TrackKind::Screen)
        );
    }
}
