use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use parley_shared::CallId;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// One uploaded piece of a call's recording.
struct Segment {
    offset: Duration,
    spec: hound::WavSpec,
    samples: Vec<i16>,
}

impl Segment {
    fn decode(offset: Duration, data: &[u8]) -> Result<Self, ServerError> {
        let reader = hound::WavReader::new(Cursor::new(data))
            .map_err(|e| ServerError::BadRequest(format!("Recording is not a WAV file: {e}")))?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(ServerError::BadRequest(
                "Recording must be 16-bit PCM".to_string(),
            ));
        }
        let samples = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::BadRequest(format!("Corrupt WAV data: {e}")))?;
        Ok(Self {
            offset,
            spec,
            samples,
        })
    }

    /// Index of this segment's first sample on the call timeline.
    fn start(&self) -> usize {
        let frames = self.offset.as_millis() as u64 * self.spec.sample_rate as u64 / 1000;
        frames as usize * self.spec.channels as usize
    }
}

/// Lay `segments` out on one call timeline. Gaps are silence; where two
/// segments overlap the later one wins.
fn assemble(mut segments: Vec<Segment>) -> Result<Vec<u8>, ServerError> {
    segments.sort_by_key(|s| s.offset);
    let Some(spec) = segments.first().map(|s| s.spec) else {
        return Err(ServerError::BadRequest("No recording segments".to_string()));
    };

    let mut timeline: Vec<i16> = Vec::new();
    for segment in &segments {
        if segment.spec != spec {
            return Err(ServerError::BadRequest(
                "Recording segments disagree on audio format".to_string(),
            ));
        }
        let start = segment.start();
        let end = start + segment.samples.len();
        if timeline.len() < end {
            timeline.resize(end, 0);
        }
        timeline[start..end].copy_from_slice(&segment.samples);
    }

    let mut cursor = Cursor::new(Vec::new());
    {
        let encode_err = |e: hound::Error| ServerError::Internal(format!("WAV encoding failed: {e}"));
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(encode_err)?;
        for sample in timeline {
            writer.write_sample(sample).map_err(encode_err)?;
        }
        writer.finalize().map_err(encode_err)?;
    }
    Ok(cursor.into_inner())
}

/// On-disk store for call recordings.
///
/// A call's recording may arrive as several segments, one per recorder,
/// each tagged with its offset from the start of the call. Segments live
/// under `{base}/{call_id}/`; after every upload they are assembled into
/// the single artifact `{base}/{call_id}.wav` that `get` serves.
///
/// Writes go through a temporary file and a rename, so a retried upload of
/// the same segment either replaces it whole or leaves the old one.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    base_path: PathBuf,
    max_size: usize,
    assembly: Arc<Mutex<()>>,
}

impl RecordingStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::RecordingStorage(format!(
                "Failed to create recording directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Recording store initialized");

        Ok(Self {
            base_path,
            max_size,
            assembly: Arc::new(Mutex::new(())),
        })
    }

    /// Location reference handed back to uploaders.
    pub fn location_of(call_id: &CallId) -> String {
        format!("/v1/recordings/{call_id}")
    }

    /// Store the segment of `call_id` starting at `offset` from the call's
    /// start, replacing a previous upload at the same offset, and rebuild
    /// the call's artifact.
    pub async fn put(
        &self,
        call_id: &CallId,
        offset: Duration,
        data: &[u8],
    ) -> Result<String, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty recording".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::RecordingTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }
        let offset = Duration::from_millis(offset.as_millis() as u64);
        let segment = Segment::decode(offset, data)?;

        let _guard = self.assembly.lock().await;

        let mut segments = self.load_segments(call_id).await?;
        segments.retain(|s| s.offset != offset);
        segments.push(segment);
        let count = segments.len();
        let artifact = assemble(segments)?;

        let dir = self.segment_dir(call_id)?;
        fs::create_dir_all(&dir).await.map_err(|e| {
            ServerError::RecordingStorage(format!("Failed to create segment directory: {e}"))
        })?;
        let segment_path = dir.join(format!("{:012}.wav", offset.as_millis()));
        write_atomic(&segment_path, data, call_id).await?;
        write_atomic(&self.recording_path(call_id)?, &artifact, call_id).await?;

        debug!(
            call = %call_id,
            offset_ms = offset.as_millis() as u64,
            size = data.len(),
            segments = count,
            "Stored recording segment"
        );
        Ok(Self::location_of(call_id))
    }

    pub async fn get(&self, call_id: &CallId) -> Result<Vec<u8>, ServerError> {
        let path = self.recording_path(call_id)?;

        if !path.exists() {
            return Err(ServerError::RecordingNotFound(*call_id));
        }

        let data = fs::read(&path).await.map_err(|e| {
            ServerError::RecordingStorage(format!("Failed to read recording {call_id}: {e}"))
        })?;

        debug!(call = %call_id, size = data.len(), "Retrieved recording");
        Ok(data)
    }

    async fn load_segments(&self, call_id: &CallId) -> Result<Vec<Segment>, ServerError> {
        let dir = self.segment_dir(call_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ServerError::RecordingStorage(format!(
                    "Failed to list segments of {call_id}: {e}"
                )))
            }
        };

        let mut segments = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ServerError::RecordingStorage(format!("Failed to list segments of {call_id}: {e}"))
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wav") {
                continue;
            }
            let Some(offset_ms) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            let data = fs::read(&path).await.map_err(|e| {
                ServerError::RecordingStorage(format!("Failed to read segment of {call_id}: {e}"))
            })?;
            match Segment::decode(Duration::from_millis(offset_ms), &data) {
                Ok(segment) => segments.push(segment),
                Err(e) => warn!(call = %call_id, path = %path.display(), error = %e, "Skipping unreadable segment"),
            }
        }
        Ok(segments)
    }

    fn recording_path(&self, call_id: &CallId) -> Result<PathBuf, ServerError> {
        let raw = self.base_path.join(format!("{call_id}.wav"));
        ensure_within(&self.base_path, &raw)
    }

    fn segment_dir(&self, call_id: &CallId) -> Result<PathBuf, ServerError> {
        let raw = self.base_path.join(call_id.to_string());
        ensure_within(&self.base_path, &raw)
    }
}

async fn write_atomic(path: &Path, data: &[u8], call_id: &CallId) -> Result<(), ServerError> {
    let tmp = path.with_extension("wav.part");
    fs::write(&tmp, data).await.map_err(|e| {
        ServerError::RecordingStorage(format!("Failed to write recording {call_id}: {e}"))
    })?;
    fs::rename(&tmp, path).await.map_err(|e| {
        ServerError::RecordingStorage(format!("Failed to commit recording {call_id}: {e}"))
    })
}
