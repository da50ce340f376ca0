/// Interval between client heartbeats, in milliseconds.
pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Liveness window: a participant silent for longer is removed.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 15_000;

/// How often each room checks its liveness timers.
pub const HEARTBEAT_SWEEP_MS: u64 = 1_000;

/// How long an ended call stays resolvable for late leaves and recording
/// uploads.
pub const ENDED_CALL_RETENTION_MS: u64 = 120_000;

/// Time a peer link may spend negotiating before an ICE restart.
pub const NEGOTIATION_TIMEOUT_MS: u64 = 10_000;

/// Grace window for the remote side to pick up an in-place track swap.
pub const TRACK_SWAP_GRACE_MS: u64 = 2_000;

/// Audio sample rate used by capture, mixing and recording.
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// Capture frame length in milliseconds.
pub const AUDIO_FRAME_MS: u32 = 20;

/// Recording slice length in milliseconds.
pub const RECORDING_CHUNK_MS: u64 = 1_000;

/// Upload attempts before a recording is declared unavailable.
pub const UPLOAD_MAX_ATTEMPTS: u32 = 5;

/// Base delay of the upload backoff, in milliseconds.
pub const UPLOAD_BASE_DELAY_MS: u64 = 500;

/// Upper bound of a single backoff delay, in milliseconds.
pub const UPLOAD_MAX_DELAY_MS: u64 = 30_000;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Maximum accepted recording artifact (256 MiB).
pub const MAX_RECORDING_SIZE: usize = 256 * 1024 * 1024;
