//! Local media capture and outgoing track control.
//!
//! `MediaCapture` is the only owner of the capture device. It is held by
//! the call controller's task and every operation takes `&mut self`, so at
//! most one device acquisition is ever in flight and a second toggle queues
//! behind the first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::select_all;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use parley_shared::{MediaState, TrackId};

/// Frames buffered per track subscriber before the slowest one lags.
const TRACK_FRAME_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Camera,
    Screen,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "microphone",
            TrackKind::Camera => "camera",
            TrackKind::Screen => "display",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No {0} available")]
    NoDevice(TrackKind),

    #[error("Permission denied for {0}")]
    PermissionDenied(TrackKind),

    #[error("{0} capture is not supported on this host")]
    Unsupported(TrackKind),

    #[error("{0} disconnected")]
    Disconnected(TrackKind),

    #[error("Capture device error: {0}")]
    Device(String),
}

struct TrackInner {
    id: TrackId,
    kind: TrackKind,
    enabled: AtomicBool,
    frames: broadcast::Sender<Vec<f32>>,
    failure: watch::Sender<Option<DeviceError>>,
}

/// A local media track. Cloning shares the same track.
///
/// Audio tracks carry fixed-size f32 frames; a disabled audio track keeps
/// emitting frames of silence so the receiving side's timeline stays intact.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        let (frames, _) = broadcast::channel(TRACK_FRAME_BUFFER);
        let (failure, _) = watch::channel(None);
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId::new(),
                kind,
                enabled: AtomicBool::new(true),
                frames,
                failure,
            }),
        }
    }

    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Publish one captured frame to every subscriber.
    pub fn push(&self, mut frame: Vec<f32>) {
        if !self.is_enabled() {
            frame.iter_mut().for_each(|s| *s = 0.0);
        }
        // No subscribers is fine.
        let _ = self.inner.frames.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<f32>> {
        self.inner.frames.subscribe()
    }

    /// Mark the track as lost (device unplugged, permission revoked).
    pub fn fail(&self, error: DeviceError) {
        self.inner.failure.send_replace(Some(error));
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failure.borrow().is_some()
    }

    /// Resolves once the track has been marked as lost.
    pub async fn failed(&self) -> DeviceError {
        let mut rx = self.inner.failure.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                // The track outlives its own sender, so this never resolves.
                return std::future::pending().await;
            }
        }
    }
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire a new track of `kind`.
    async fn open(&self, kind: TrackKind) -> Result<LocalTrack, DeviceError>;

    /// Release the device behind `track`.
    async fn release(&self, track: &LocalTrack);
}

/// A media type the call continues without.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityLoss {
    pub kind: TrackKind,
    pub error: DeviceError,
}

/// The outgoing video track changed and must be swapped on every peer link.
#[derive(Debug, Clone)]
pub struct TrackSwap {
    pub video: Option<LocalTrack>,
}

pub struct MediaCapture {
    device: Arc<dyn CaptureDevice>,
    audio: Option<LocalTrack>,
    camera: Option<LocalTrack>,
    screen: Option<LocalTrack>,
    outgoing_video: Option<LocalTrack>,
    state: MediaState,
}

impl MediaCapture {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            audio: None,
            camera: None,
            screen: None,
            outgoing_video: None,
            state: MediaState {
                audio_enabled: false,
                video_enabled: false,
                screen_sharing: false,
            },
        }
    }

    /// Acquire audio, and the camera when `with_video`. Device failures are
    /// returned as capability losses; the tracks that did open stay open.
    pub async fn start(&mut self, with_video: bool) -> Vec<CapabilityLoss> {
        let mut losses = Vec::new();

        match self.device.open(TrackKind::Audio).await {
            Ok(track) => {
                info!(track = %track.id(), "Microphone acquired");
                self.audio = Some(track);
                self.state.audio_enabled = true;
            }
            Err(error) => {
                warn!(error = %error, "Microphone unavailable, continuing without audio");
                losses.push(CapabilityLoss {
                    kind: TrackKind::Audio,
                    error,
                });
            }
        }

        if with_video {
            match self.device.open(TrackKind::Camera).await {
                Ok(track) => {
                    info!(track = %track.id(), "Camera acquired");
                    self.outgoing_video = Some(track.clone());
                    self.camera = Some(track);
                    self.state.video_enabled = true;
                }
                Err(error) => {
                    warn!(error = %error, "Camera unavailable, continuing without video");
                    losses.push(CapabilityLoss {
                        kind: TrackKind::Camera,
                        error,
                    });
                }
            }
        }

        losses
    }

    pub fn media_state(&self) -> MediaState {
        self.state
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn outgoing_video(&self) -> Option<&LocalTrack> {
        self.outgoing_video.as_ref()
    }

    /// Flip the audio-enabled flag on the existing track. Returns `None`
    /// when there is no microphone to mute.
    pub fn toggle_audio(&mut self) -> Option<MediaState> {
        let track = self.audio.as_ref()?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        self.state.audio_enabled = enabled;
        debug!(enabled, "Audio toggled");
        Some(self.state)
    }

    /// Flip the video-enabled flag, acquiring the camera if it has never
    /// been opened. Returns a swap when the outgoing video track changed.
    pub async fn toggle_video(&mut self) -> Result<Option<TrackSwap>, DeviceError> {
        if self.state.video_enabled {
            if let Some(camera) = &self.camera {
                camera.set_enabled(false);
            }
            self.state.video_enabled = false;
            debug!("Video disabled");
            return Ok(None);
        }

        let camera = match &self.camera {
            Some(camera) => camera.clone(),
            None => {
                let camera = self.device.open(TrackKind::Camera).await?;
                info!(track = %camera.id(), "Camera acquired");
                self.camera = Some(camera.clone());
                camera
            }
        };
        camera.set_enabled(true);
        self.state.video_enabled = true;
        debug!("Video enabled");

        if self.screen.is_none() && !same_track(self.outgoing_video.as_ref(), Some(&camera)) {
            self.outgoing_video = Some(camera.clone());
            return Ok(Some(TrackSwap {
                video: Some(camera),
            }));
        }
        Ok(None)
    }

    pub async fn start_screen_share(&mut self) -> Result<TrackSwap, DeviceError> {
        if let Some(screen) = &self.screen {
            return Ok(TrackSwap {
                video: Some(screen.clone()),
            });
        }

        let screen = self.device.open(TrackKind::Screen).await?;
        info!(track = %screen.id(), "Screen share started");
        self.screen = Some(screen.clone());
        self.outgoing_video = Some(screen.clone());
        self.state.screen_sharing = true;
        Ok(TrackSwap {
            video: Some(screen),
        })
    }

    /// Revert to the camera, or to no video if video is disabled. Returns
    /// `None` when no share was running.
    pub async fn stop_screen_share(&mut self) -> Option<TrackSwap> {
        let screen = self.screen.take()?;
        self.device.release(&screen).await;
        self.state.screen_sharing = false;

        self.outgoing_video = if self.state.video_enabled {
            self.camera.clone()
        } else {
            None
        };
        info!(camera = self.outgoing_video.is_some(), "Screen share stopped");
        Some(TrackSwap {
            video: self.outgoing_video.clone(),
        })
    }

    /// Resolves when any held track is lost. Pending forever with no tracks.
    pub async fn next_loss(&self) -> (TrackKind, DeviceError) {
        let tracks: Vec<LocalTrack> = [&self.audio, &self.camera, &self.screen]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        if tracks.is_empty() {
            return std::future::pending().await;
        }
        let waits = tracks.into_iter().map(|track| {
            Box::pin(async move { (track.kind(), track.failed().await) })
        });
        select_all(waits).await.0
    }

    /// Drop a lost track. Returns a swap when it was the outgoing video.
    pub async fn handle_loss(&mut self, kind: TrackKind) -> Option<TrackSwap> {
        let slot = match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Camera => &mut self.camera,
            TrackKind::Screen => &mut self.screen,
        };
        let track = slot.take()?;
        self.device.release(&track).await;
        warn!(kind = %kind, track = %track.id(), "Capture track lost");

        match kind {
            TrackKind::Audio => {
                self.state.audio_enabled = false;
                None
            }
            TrackKind::Camera => {
                self.state.video_enabled = false;
                if same_track(self.outgoing_video.as_ref(), Some(&track)) {
                    self.outgoing_video = None;
                    Some(TrackSwap { video: None })
                } else {
                    None
                }
            }
            TrackKind::Screen => {
                self.state.screen_sharing = false;
                self.outgoing_video = if self.state.video_enabled {
                    self.camera.clone()
                } else {
                    None
                };
                Some(TrackSwap {
                    video: self.outgoing_video.clone(),
                })
            }
        }
    }

    /// Release every device.
    pub async fn stop(&mut self) {
        for track in [self.audio.take(), self.camera.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            self.device.release(&track).await;
        }
        self.outgoing_video = None;
        self.state = MediaState {
            audio_enabled: false,
            video_enabled: false,
            screen_sharing: false,
        };
        debug!("Media capture stopped");
    }
}

fn same_track(a: Option<&LocalTrack>, b: Option<&LocalTrack>) -> bool {
    a.map(LocalTrack::id) == b.map(LocalTrack::id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Device that opens tracks on demand and records what happened.
    #[derive(Default)]
    struct FakeDevice {
        deny: Mutex<Vec<TrackKind>>,
        opened: Mutex<Vec<TrackKind>>,
        released: Mutex<Vec<TrackKind>>,
    }

    impl FakeDevice {
        fn denying(kinds: &[TrackKind]) -> Self {
            Self {
                deny: Mutex::new(kinds.to_vec()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CaptureDevice for FakeDevice {
        async fn open(&self, kind: TrackKind) -> Result<LocalTrack, DeviceError> {
            if self.deny.lock().unwrap().contains(&kind) {
                return Err(DeviceError::PermissionDenied(kind));
            }
            self.opened.lock().unwrap().push(kind);
            Ok(LocalTrack::new(kind))
        }

        async fn release(&self, track: &LocalTrack) {
            self.released.lock().unwrap().push(track.kind());
        }
    }

    #[tokio::test]
    async fn test_start_reports_capability_loss() {
        let device = Arc::new(FakeDevice::denying(&[TrackKind::Camera]));
        let mut capture = MediaCapture::new(device);

        let losses = capture.start(true).await;
        assert_eq!(
            losses,
            vec![CapabilityLoss {
                kind: TrackKind::Camera,
                error: DeviceError::PermissionDenied(TrackKind::Camera),
            }]
        );
        let state = capture.media_state();
        assert!(state.audio_enabled);
        assert!(!state.video_enabled);
        assert!(capture.audio_track().is_some());
    }

    #[tokio::test]
    async fn test_toggle_audio_keeps_track_identity() {
        let mut capture = MediaCapture::new(Arc::new(FakeDevice::default()));
        capture.start(false).await;
        let before = capture.audio_track().unwrap().id();

        let muted = capture.toggle_audio().unwrap();
        assert!(!muted.audio_enabled);
        assert!(!capture.audio_track().unwrap().is_enabled());
        let unmuted = capture.toggle_audio().unwrap();
        assert!(unmuted.audio_enabled);
        assert_eq!(capture.audio_track().unwrap().id(), before);
    }

    #[tokio::test]
    async fn test_muted_track_sends_silence() {
        let track = LocalTrack::new(TrackKind::Audio);
        let mut rx = track.subscribe();
        track.set_enabled(false);
        track.push(vec![0.5; 4]);
        assert_eq!(rx.recv().await.unwrap(), vec![0.0; 4]);
    }

    #[tokio::test]
    async fn test_toggle_video_off_and_on_without_swap() {
        let device = Arc::new(FakeDevice::default());
        let mut capture = MediaCapture::new(device.clone());
        capture.start(true).await;
        let camera = capture.outgoing_video().unwrap().id();

        assert!(capture.toggle_video().await.unwrap().is_none());
        assert!(!capture.media_state().video_enabled);
        assert!(capture.toggle_video().await.unwrap().is_none());
        assert!(capture.media_state().video_enabled);
        assert_eq!(capture.outgoing_video().unwrap().id(), camera);
        assert_eq!(device.opened.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_toggle_video_acquires_camera_once() {
        let device = Arc::new(FakeDevice::default());
        let mut capture = MediaCapture::new(device.clone());
        capture.start(false).await;

        let swap = capture.toggle_video().await.unwrap().unwrap();
        assert_eq!(swap.video.unwrap().kind(), TrackKind::Camera);
        capture.toggle_video().await.unwrap();
        capture.toggle_video().await.unwrap();
        let opened = device.opened.lock().unwrap().clone();
        assert_eq!(opened, vec![TrackKind::Audio, TrackKind::Camera]);
    }

    #[tokio::test]
    async fn test_screen_share_reverts_to_camera_or_nothing() {
        let device = Arc::new(FakeDevice::default());
        let mut capture = MediaCapture::new(device.clone());
        capture.start(true).await;
        let camera = capture.outgoing_video().unwrap().id();

        let swap = capture.start_screen_share().await.unwrap();
        assert_eq!(swap.video.unwrap().kind(), TrackKind::Screen);
        assert!(capture.media_state().screen_sharing);

        let swap = capture.stop_screen_share().await.unwrap();
        assert_eq!(swap.video.unwrap().id(), camera);
        assert!(capture.stop_screen_share().await.is_none());

        capture.toggle_video().await.unwrap();
        capture.start_screen_share().await.unwrap();
        let swap = capture.stop_screen_share().await.unwrap();
        assert!(swap.video.is_none());
        assert!(capture.outgoing_video().is_none());
    }

    #[tokio::test]
    async fn test_screen_share_denied_is_error() {
        let device = Arc::new(FakeDevice::denying(&[TrackKind::Screen]));
        let mut capture = MediaCapture::new(device);
        capture.start(false).await;
        assert_eq!(
            capture.start_screen_share().await.unwrap_err(),
            DeviceError::PermissionDenied(TrackKind::Screen)
        );
        assert!(!capture.media_state().screen_sharing);
    }

    #[tokio::test]
    async fn test_lost_camera_is_reported_and_dropped() {
        let device = Arc::new(FakeDevice::default());
        let mut capture = MediaCapture::new(device.clone());
        capture.start(true).await;

        capture
            .outgoing_video()
            .unwrap()
            .fail(DeviceError::Disconnected(TrackKind::Camera));
        let (kind, error) = capture.next_loss().await;
        assert_eq!(kind, TrackKind::Camera);
        assert_eq!(error, DeviceError::Disconnected(TrackKind::Camera));

        let swap = capture.handle_loss(kind).await.unwrap();
        assert!(swap.video.is_none());
        assert!(!capture.media_state().video_enabled);
        assert_eq!(*device.released.lock().unwrap(), vec![TrackKind::Camera]);
    }
}
