//! WebRTC transport built on webrtc-rs.
//!
//! Audio is sent as G.711 µ-law (PCMU) at 8 kHz: frames from the local
//! capture track are decimated from the capture rate, encoded and written
//! as samples. Received PCMU is decoded, brought back to the capture rate
//! and pushed into the link's recording tap. Video travels on a dedicated
//! transceiver whose sender track is swapped in place.
//!
//! Media counts as started on the first RTP packet from the remote or the
//! first RTCP report about our audio, not on ICE connectivity alone. A video
//! swap is acknowledged by the first RTCP report on the video sender after
//! the swap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use parley_shared::constants::{AUDIO_FRAME_MS, AUDIO_SAMPLE_RATE};
use parley_shared::{TrackId, UserId};

use crate::capture::LocalTrack;
use crate::mixer::TapSlot;
use crate::peer::{
    LinkContext, MediaTransport, PeerEvent, PeerEventKind, PeerEventSender, TransportError,
    TransportFactory,
};

const PCMU_RATE: u32 = 8_000;
const STREAM_ID: &str = "parley";
const RTCP_BUFFER: usize = 1500;

/// Default public STUN servers
pub fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

fn rtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRtc(e.to_string())
}

/// Sends link events from webrtc callbacks.
#[derive(Clone)]
struct Notifier {
    events: PeerEventSender,
    remote: UserId,
    link_id: u64,
}

impl Notifier {
    fn send(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent {
            remote: self.remote.clone(),
            link_id: self.link_id,
            kind,
        });
    }
}

/// Reports `MediaStarted` once per negotiation round.
#[derive(Clone)]
struct MediaWatch {
    awaiting: Arc<AtomicBool>,
    notifier: Notifier,
}

impl MediaWatch {
    fn new(notifier: Notifier) -> Self {
        Self {
            awaiting: Arc::new(AtomicBool::new(true)),
            notifier,
        }
    }

    /// Wait for fresh media again, after a restart or a failure.
    fn arm(&self) {
        self.awaiting.store(true, Ordering::SeqCst);
    }

    fn saw_media(&self) {
        if self.awaiting.swap(false, Ordering::SeqCst) {
            debug!(remote = %self.notifier.remote, link = self.notifier.link_id, "First media from remote");
            self.notifier.send(PeerEventKind::MediaStarted);
        }
    }
}

/// Acknowledge swap `token` on the first report counted after this call.
fn ack_after_next_report(
    mut reports: watch::Receiver<u64>,
    notifier: Notifier,
    token: u64,
) -> JoinHandle<()> {
    reports.borrow_and_update();
    tokio::spawn(async move {
        if reports.changed().await.is_ok() {
            debug!(remote = %notifier.remote, token, "Remote is receiving the swapped track");
            notifier.send(PeerEventKind::TrackSwapAcked(token));
        }
    })
}

/// Drain RTCP from `sender`, calling `on_report` per batch, until the
/// connection closes.
fn read_reports(sender: Arc<RTCRtpSender>, on_report: impl Fn() + Send + 'static) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; RTCP_BUFFER];
        while sender.read(&mut rtcp_buf).await.is_ok() {
            on_report();
        }
    })
}

pub struct RtcFactory {
    config: RtcConfig,
}

impl RtcFactory {
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }

    async fn new_peer_connection(&self) -> Result<RTCPeerConnection, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        api.new_peer_connection(config).await.map_err(rtc_err)
    }
}

#[async_trait]
impl TransportFactory for RtcFactory {
    async fn connect(&self, ctx: LinkContext) -> Result<Box<dyn MediaTransport>, TransportError> {
        let pc = Arc::new(self.new_peer_connection().await?);
        let notifier = Notifier {
            events: ctx.events.clone(),
            remote: ctx.remote.clone(),
            link_id: ctx.link_id,
        };

        let media = MediaWatch::new(notifier.clone());
        install_handlers(&pc, &media, ctx.remote_audio.clone());

        let audio_out = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: PCMU_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        ));
        let audio_sender = pc
            .add_track(Arc::clone(&audio_out) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;

        let transceiver = pc
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .map_err(rtc_err)?;
        let video_sender = transceiver.sender().await;
        if let Some(video) = &ctx.video {
            video_sender
                .replace_track(Some(video_track_for(video)))
                .await
                .map_err(rtc_err)?;
        }

        let video_reports = Arc::new(watch::channel(0u64).0);
        let audio_watch = media.clone();
        let video_counter = Arc::clone(&video_reports);
        let mut tasks = vec![
            read_reports(audio_sender, move || audio_watch.saw_media()),
            read_reports(Arc::clone(&video_sender), move || {
                video_counter.send_modify(|n| *n += 1)
            }),
        ];
        if let Some(track) = ctx.audio.clone() {
            tasks.push(tokio::spawn(pump_audio(track, audio_out)));
        }

        debug!(remote = %ctx.remote, link = ctx.link_id, "WebRTC peer connection created");
        Ok(Box::new(RtcTransport {
            pc,
            video_sender,
            video_reports,
            audio_id: ctx.audio.as_ref().map(LocalTrack::id),
            notifier,
            media,
            tasks: Mutex::new(tasks),
            swap_watch: Mutex::new(None),
        }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, media: &MediaWatch, slot: TapSlot) {
    let notifier = &media.notifier;
    let state_watch = media.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        debug!(remote = %state_watch.notifier.remote, state = ?s, "Peer connection state");
        if s == RTCPeerConnectionState::Failed {
            state_watch.arm();
            state_watch.notifier.send(PeerEventKind::TransportFailed);
        }
        Box::pin(async {})
    }));

    let ice_notifier = notifier.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            if let Ok(json) = c.to_json() {
                if let Ok(candidate_str) = serde_json::to_string(&json) {
                    ice_notifier.send(PeerEventKind::LocalCandidate(candidate_str));
                }
            }
        }
        Box::pin(async {})
    }));

    let track_watch = media.clone();
    pc.on_track(Box::new(move |track, _, _| {
        let slot = slot.clone();
        let media = track_watch.clone();
        let remote = track_watch.notifier.remote.clone();
        Box::pin(async move {
            info!(remote = %remote, kind = %track.kind(), "Received track");
            let is_audio = track.kind() == RTPCodecType::Audio;
            tokio::spawn(async move {
                while let Ok((packet, _)) = track.read_rtp().await {
                    media.saw_media();
                    if is_audio {
                        let pcm = ulaw_decode(&packet.payload);
                        slot.push(upsample(&pcm, AUDIO_SAMPLE_RATE / PCMU_RATE));
                    }
                }
                debug!(remote = %remote, audio = is_audio, "Remote track ended");
            });
        })
    }));
}

fn video_track_for(track: &LocalTrack) -> Arc<dyn TrackLocal + Send + Sync> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            ..Default::default()
        },
        track.id().to_string(),
        STREAM_ID.to_string(),
    ))
}

async fn pump_audio(track: LocalTrack, out: Arc<TrackLocalStaticSample>) {
    let step = (AUDIO_SAMPLE_RATE / PCMU_RATE) as usize;
    let mut frames = track.subscribe();
    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Audio sender lagging");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let encoded = ulaw_encode(&decimate(&frame, step));
        let sample = Sample {
            data: Bytes::from(encoded),
            duration: Duration::from_millis(AUDIO_FRAME_MS as u64),
            ..Default::default()
        };
        if let Err(e) = out.write_sample(&sample).await {
            warn!(error = %e, "Failed to write audio sample");
        }
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
    /// Count of RTCP batches received for the video sender.
    video_reports: Arc<watch::Sender<u64>>,
    audio_id: Option<TrackId>,
    notifier: Notifier,
    media: MediaWatch,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    swap_watch: Mutex<Option<JoinHandle<()>>>,
}

impl RtcTransport {
    fn replace_swap_watch(&self, watcher: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(
            &mut *self.swap_watch.lock().unwrap_or_else(|e| e.into_inner()),
            watcher,
        );
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError> {
        if ice_restart {
            self.media.arm();
        }
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError> {
        if self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            debug!(remote = %self.notifier.remote, "Rolling back local offer");
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc
                .set_local_description(rollback)
                .await
                .map_err(rtc_err)?;
        }

        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc.set_remote_description(offer).await.map_err(rtc_err)?;
        self.media.arm();

        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(rtc_err)
    }

    async fn add_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))?;
        self.pc.add_ice_candidate(init).await.map_err(rtc_err)
    }

    async fn replace_video_track(
        &self,
        track: Option<LocalTrack>,
        token: u64,
    ) -> Result<(), TransportError> {
        self.video_sender
            .replace_track(track.as_ref().map(video_track_for))
            .await
            .map_err(rtc_err)?;
        if track.is_some() {
            self.replace_swap_watch(Some(ack_after_next_report(
                self.video_reports.subscribe(),
                self.notifier.clone(),
                token,
            )));
        } else {
            // Nothing left for the remote to receive.
            self.replace_swap_watch(None);
            self.notifier.send(PeerEventKind::TrackSwapAcked(token));
        }
        Ok(())
    }

    fn audio_track_id(&self) -> Option<TrackId> {
        self.audio_id
    }

    async fn close(&self) {
        self.replace_swap_watch(None);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            warn!(remote = %self.notifier.remote, error = %e, "Error closing peer connection");
        }
    }
}

/// Keep every `step`-th sample.
fn decimate(frame: &[f32], step: usize) -> Vec<f32> {
    frame.iter().step_by(step.max(1)).copied().collect()
}

/// Repeat every sample `factor` times.
fn upsample(pcm: &[i16], factor: u32) -> Vec<f32> {
    pcm.iter()
        .flat_map(|&s| std::iter::repeat_n(s as f32 / i16::MAX as f32, factor.max(1) as usize))
        .collect()
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32_635;

fn ulaw_encode(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|&s| ulaw_compress((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

fn ulaw_decode(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| ulaw_expand(b)).collect()
}

fn ulaw_compress(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

fn ulaw_expand(byte: u8) -> i16 {
    let u = !byte as i32;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn notifier() -> (Notifier, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Notifier {
                events: tx,
                remote: UserId::new("b"),
                link_id: 7,
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

    #[test]
    fn test_media_started_once_per_round() {
        let (notifier, mut rx) = notifier();
        let media = MediaWatch::new(notifier);
        assert!(kinds(&mut rx).is_empty());

        media.saw_media();
        media.saw_media();
        assert_eq!(kinds(&mut rx), vec![PeerEventKind::MediaStarted]);

        media.arm();
        assert!(kinds(&mut rx).is_empty());
        media.saw_media();
        assert_eq!(kinds(&mut rx), vec![PeerEventKind::MediaStarted]);
    }

    #[tokio::test]
    async fn test_swap_ack_waits_for_a_report_after_the_swap() {
        let (notifier, mut rx) = notifier();
        let (reports, _) = watch::channel(0u64);
        reports.send_modify(|n| *n += 1);

        let watcher = ack_after_next_report(reports.subscribe(), notifier, 3);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(kinds(&mut rx).is_empty());

        reports.send_modify(|n| *n += 1);
        watcher.await.unwrap();
        assert_eq!(kinds(&mut rx), vec![PeerEventKind::TrackSwapAcked(3)]);
    }

    #[test]
    fn test_ulaw_silence() {
        assert_eq!(ulaw_compress(0), 0xFF);
        assert_eq!(ulaw_expand(0xFF), 0);
    }

    #[test]
    fn test_ulaw_round_trip_error_is_bounded() {
        for sample in [100i16, -100, 1000, -1000, 10_000, -10_000, 32_000, -32_000] {
            let decoded = ulaw_expand(ulaw_compress(sample));
            let error = (decoded as i32 - sample as i32).abs();
            // Quantisation step grows with magnitude: at most 1/16 of it.
            assert!(error <= (sample as i32).abs() / 16 + 8, "{sample} -> {decoded}");
            assert_eq!(decoded.signum(), sample.signum());
        }
    }

    #[test]
    fn test_rate_conversion_preserves_frame_duration() {
        let frame = vec![0.25f32; 960];
        let narrow = decimate(&frame, 6);
        assert_eq!(narrow.len(), 160);

        let wide = upsample(&ulaw_decode(&ulaw_encode(&narrow)), 6);
        assert_eq!(wide.len(), 960);
        assert!(wide.iter().all(|s| (s - 0.25).abs() < 0.02));
    }
}
