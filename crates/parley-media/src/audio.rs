use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use parley_shared::constants::{AUDIO_FRAME_MS, AUDIO_SAMPLE_RATE};
use parley_shared::TrackId;

use crate::capture::{CaptureDevice, DeviceError, LocalTrack, TrackKind};

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: AUDIO_SAMPLE_RATE,
            channels: 1,
            frame_size_ms: AUDIO_FRAME_MS,
        }
    }
}

impl AudioConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }
}

/// The host's default microphone via cpal. Camera and display capture are
/// not available on this backend.
pub struct CpalDevice {
    config: AudioConfig,
    active: Mutex<HashMap<TrackId, Arc<AtomicBool>>>,
}

impl CpalDevice {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn start_capture(&self) -> Result<LocalTrack, DeviceError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(DeviceError::NoDevice(TrackKind::Audio))?;

        info!(device = ?device.name(), "Using input device");

        let config = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let track = LocalTrack::new(TrackKind::Audio);
        let frame_size = self.config.frame_size_samples();
        let channels = self.config.channels.max(1) as usize;
        let mut buffer = Vec::with_capacity(frame_size);
        let active = Arc::new(AtomicBool::new(true));

        let data_track = track.clone();
        let data_active = active.clone();
        let err_track = track.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if !data_active.load(Ordering::Relaxed) {
                        return;
                    }
                    // Keep the first channel only; frames are mono.
                    buffer.extend(data.iter().step_by(channels));
                    while buffer.len() >= frame_size {
                        let frame: Vec<f32> = buffer.drain(..frame_size).collect();
                        data_track.push(frame);
                    }
                },
                move |err| {
                    error!("Audio input error: {err}");
                    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                        err_track.fail(DeviceError::Disconnected(TrackKind::Audio));
                    }
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    DeviceError::NoDevice(TrackKind::Audio)
                }
                other => DeviceError::Device(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| DeviceError::Device(e.to_string()))?;

        // Keep stream alive (cleaned up via active flag; callback becomes no-op)
        std::mem::forget(stream);

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(track.id(), active);
        debug!(track = %track.id(), "Audio capture started");
        Ok(track)
    }
}

#[async_trait]
impl CaptureDevice for CpalDevice {
    async fn open(&self, kind: TrackKind) -> Result<LocalTrack, DeviceError> {
        match kind {
            TrackKind::Audio => self.start_capture(),
            other => Err(DeviceError::Unsupported(other)),
        }
    }

    async fn release(&self, track: &LocalTrack) {
        let flag = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&track.id());
        match flag {
            Some(flag) => {
                flag.store(false, Ordering::SeqCst);
                debug!(track = %track.id(), "Audio capture stopped");
            }
            None => warn!(track = %track.id(), "Release of unknown capture track"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let config = AudioConfig::default();
        assert_eq!(config.frame_size_samples(), 960);

        let narrow = AudioConfig {
            sample_rate: 8_000,
            ..AudioConfig::default()
        };
        assert_eq!(narrow.frame_size_samples(), 160);
    }

    #[tokio::test]
    async fn test_video_is_unsupported() {
        let device = CpalDevice::new(AudioConfig::default());
        assert_eq!(
            device.open(TrackKind::Camera).await.unwrap_err(),
            DeviceError::Unsupported(TrackKind::Camera)
        );
        assert_eq!(
            device.open(TrackKind::Screen).await.unwrap_err(),
            DeviceError::Unsupported(TrackKind::Screen)
        );
    }
}
