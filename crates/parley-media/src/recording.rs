//! Recording & upload pipeline.
//!
//! One pipeline per recorder. A task owns the [`MixingGraph`], slices its
//! output into [`RecordingChunk`]s on a fixed wall-clock interval, and on
//! `finish` encodes everything as a single mono 16-bit WAV segment and
//! uploads it to a [`RecordingSink`] with bounded exponential backoff.
//!
//! A pipeline knows how far into the call it started. When the recorder
//! leaves and another participant takes over, the new pipeline's segment
//! carries a later offset and the sink lays both on one call timeline.
//!
//! ```text
//!  local mic ──tap──┐
//!  remote u2 ──tap──┼─> MixingGraph ──tick──> chunks ──finish──> WAV ──> sink
//!  remote u3 ──tap──┘                                              (retry)
//! ```

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use parley_shared::constants::{
    AUDIO_SAMPLE_RATE, RECORDING_CHUNK_MS, UPLOAD_BASE_DELAY_MS, UPLOAD_MAX_ATTEMPTS,
    UPLOAD_MAX_DELAY_MS,
};
use parley_shared::{CallId, UserId};

use crate::mixer::{AudioTap, MixingGraph};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Storage rejected the recording: {0}")]
    Rejected(String),

    #[error("Storage unreachable: {0}")]
    Unreachable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordingError {
    #[error("Recording pipeline is no longer running")]
    Stopped,

    #[error("WAV encoding failed: {0}")]
    Encode(String),
}

/// The storage collaborator that keeps finished recordings.
#[async_trait]
pub trait RecordingSink: Send + Sync {
    /// Store `artifact`, the part of `call_id`'s recording that starts
    /// `offset` after the call started, and return a location reference.
    async fn upload(
        &self,
        call_id: &CallId,
        offset: Duration,
        artifact: Bytes,
    ) -> Result<String, SinkError>;
}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: UPLOAD_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(UPLOAD_BASE_DELAY_MS),
            max_delay: Duration::from_millis(UPLOAD_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Compute the delay for retry `n` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay * 2u32.saturating_pow(attempt);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub sample_rate: u32,
    pub chunk_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            sample_rate: AUDIO_SAMPLE_RATE,
            chunk_interval: Duration::from_millis(RECORDING_CHUNK_MS),
            retry: RetryPolicy::default(),
        }
    }
}

impl RecordingConfig {
    fn samples_in(&self, elapsed: Duration) -> u64 {
        (elapsed.as_nanos() * self.sample_rate as u128 / 1_000_000_000) as u64
    }
}

/// One time-stamped slice of the mixed stream.
#[derive(Debug, Clone)]
pub struct RecordingChunk {
    pub sequence: u64,
    /// Offset of the first sample from the start of the call.
    pub offset: Duration,
    pub samples: Vec<i16>,
}

/// Outcome reported to whoever ends the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingStatus {
    Uploaded {
        location: String,
        attempts: u32,
        duration: Duration,
    },
    /// No audio source was ever attached, so nothing was uploaded.
    NoRecording,
    /// Every upload attempt failed; the artifact was discarded.
    Unavailable { attempts: u32, last_error: String },
}

enum PipelineCommand {
    AddSource {
        source: UserId,
        reply: oneshot::Sender<AudioTap>,
    },
    RemoveSource(UserId),
    Finish {
        reply: oneshot::Sender<RecordingStatus>,
    },
}

/// Handle to a running pipeline. Dropping it without `finish` discards the
/// recording and stops the slicing timer.
pub struct RecordingPipeline {
    call_id: CallId,
    offset: Duration,
    commands: mpsc::Sender<PipelineCommand>,
}

impl RecordingPipeline {
    /// Start recording `call_id`, which has been running for `offset`.
    pub fn start(
        call_id: CallId,
        offset: Duration,
        config: RecordingConfig,
        sink: Arc<dyn RecordingSink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_pipeline(call_id, offset, config, sink, rx));
        info!(call = %call_id, offset_ms = offset.as_millis() as u64, "Recording started");
        Self {
            call_id,
            offset,
            commands: tx,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Where this recording starts on the call timeline.
    pub fn offset(&self) -> Duration {
        self.offset
    }

    /// Attach an audio source. Existing inputs are not disturbed.
    pub async fn add_source(&self, source: UserId) -> Result<AudioTap, RecordingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(PipelineCommand::AddSource { source, reply: tx })
            .await
            .map_err(|_| RecordingError::Stopped)?;
        rx.await.map_err(|_| RecordingError::Stopped)
    }

    /// Detach an audio source; it is silent from here on.
    pub async fn remove_source(&self, source: &UserId) {
        let _ = self
            .commands
            .send(PipelineCommand::RemoveSource(source.clone()))
            .await;
    }

    /// Stop slicing, encode and upload. Resolves once the upload succeeded
    /// or the retry budget is spent.
    pub async fn finish(self) -> RecordingStatus {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(PipelineCommand::Finish { reply: tx })
            .await
            .is_err()
        {
            return RecordingStatus::Unavailable {
                attempts: 0,
                last_error: RecordingError::Stopped.to_string(),
            };
        }
        rx.await.unwrap_or_else(|_| RecordingStatus::Unavailable {
            attempts: 0,
            last_error: RecordingError::Stopped.to_string(),
        })
    }
}

async fn run_pipeline(
    call_id: CallId,
    offset: Duration,
    config: RecordingConfig,
    sink: Arc<dyn RecordingSink>,
    mut commands: mpsc::Receiver<PipelineCommand>,
) {
    let chunk_samples = config.samples_in(config.chunk_interval) as usize;
    let mut graph = MixingGraph::new(chunk_samples * 2);
    let mut chunks: Vec<RecordingChunk> = Vec::new();
    let mut rendered: u64 = 0;
    let mut had_source = false;

    let start = Instant::now();
    let mut slicer = interval_at(start + config.chunk_interval, config.chunk_interval);
    slicer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            cmd = commands.recv() => match cmd {
                Some(PipelineCommand::AddSource { source, reply }) => {
                    had_source = true;
                    let _ = reply.send(graph.add_input(source));
                }
                Some(PipelineCommand::RemoveSource(source)) => {
                    graph.remove_input(&source);
                }
                Some(PipelineCommand::Finish { reply }) => {
                    let target = config.samples_in(start.elapsed());
                    if let Some(chunk) = slice(&mut graph, &mut rendered, target, chunks.len(), offset, &config) {
                        chunks.push(chunk);
                    }
                    let status = if had_source {
                        deliver(call_id, offset, &chunks, &config, sink.as_ref()).await
                    } else {
                        info!(call = %call_id, "No audio source was attached, nothing to upload");
                        RecordingStatus::NoRecording
                    };
                    let _ = reply.send(status);
                    return;
                }
                None => {
                    warn!(call = %call_id, chunks = chunks.len(), "Recording abandoned without finish");
                    return;
                }
            },

            _ = slicer.tick() => {
                let target = config.samples_in(start.elapsed());
                if let Some(chunk) = slice(&mut graph, &mut rendered, target, chunks.len(), offset, &config) {
                    debug!(call = %call_id, sequence = chunk.sequence, samples = chunk.samples.len(), "Recording chunk");
                    chunks.push(chunk);
                }
            }
        }
    }
}

/// Render everything between `rendered` and `target` samples as one chunk.
fn slice(
    graph: &mut MixingGraph,
    rendered: &mut u64,
    target: u64,
    sequence: usize,
    start: Duration,
    config: &RecordingConfig,
) -> Option<RecordingChunk> {
    if target <= *rendered {
        return None;
    }
    let count = (target - *rendered) as usize;
    let offset =
        start + Duration::from_nanos(*rendered * 1_000_000_000 / config.sample_rate as u64);
    let samples = graph
        .render(count)
        .into_iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect();
    *rendered = target;
    Some(RecordingChunk {
        sequence: sequence as u64,
        offset,
        samples,
    })
}

/// Concatenate chunks into a mono 16-bit WAV file.
pub fn encode_wav(chunks: &[RecordingChunk], sample_rate: u32) -> Result<Bytes, RecordingError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| RecordingError::Encode(e.to_string()))?;
        for sample in chunks.iter().flat_map(|c| c.samples.iter()) {
            writer
                .write_sample(*sample)
                .map_err(|e| RecordingError::Encode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| RecordingError::Encode(e.to_string()))?;
    }
    Ok(Bytes::from(cursor.into_inner()))
}

async fn deliver(
    call_id: CallId,
    offset: Duration,
    chunks: &[RecordingChunk],
    config: &RecordingConfig,
    sink: &dyn RecordingSink,
) -> RecordingStatus {
    let total: usize = chunks.iter().map(|c| c.samples.len()).sum();
    if total == 0 {
        return RecordingStatus::NoRecording;
    }
    let duration = Duration::from_nanos(total as u64 * 1_000_000_000 / config.sample_rate as u64);

    let artifact = match encode_wav(chunks, config.sample_rate) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(call = %call_id, error = %e, "Failed to encode recording");
            return RecordingStatus::Unavailable {
                attempts: 0,
                last_error: e.to_string(),
            };
        }
    };

    let policy = &config.retry;
    let mut last_error = String::new();

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let delay = policy.delay_for(attempt - 1);
            info!(
                call = %call_id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying recording upload"
            );
            tokio::time::sleep(delay).await;
        }

        match sink.upload(&call_id, offset, artifact.clone()).await {
            Ok(location) => {
                info!(
                    call = %call_id,
                    location = %location,
                    offset_ms = offset.as_millis() as u64,
                    bytes = artifact.len(),
                    duration_ms = duration.as_millis() as u64,
                    attempts = attempt + 1,
                    "Recording uploaded"
                );
                return RecordingStatus::Uploaded {
                    location,
                    attempts: attempt + 1,
                    duration,
                };
            }
            Err(e) => {
                warn!(call = %call_id, attempt = attempt + 1, error = %e, "Recording upload failed");
                last_error = e.to_string();
            }
        }
    }

    error!(
        call = %call_id,
        attempts = policy.max_attempts,
        error = %last_error,
        "Recording unavailable, upload retries exhausted"
    );
    RecordingStatus::Unavailable {
        attempts: policy.max_attempts,
        last_error,
    }
}
