//! Client configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use parley_media::{PeerTimeouts, RecordingConfig};
use parley_shared::constants::{
    HEARTBEAT_INTERVAL_MS, NEGOTIATION_TIMEOUT_MS, RECORDING_CHUNK_MS, TRACK_SWAP_GRACE_MS,
    UPLOAD_BASE_DELAY_MS, UPLOAD_MAX_ATTEMPTS,
};
use parley_shared::{RoomId, UserId};

use crate::controller::ControllerConfig;
use crate::error::ClientError;

/// Which client records the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingPolicy {
    /// Record while this client is the host, taking over when promoted.
    #[default]
    Host,
    Always,
    Off,
}

impl FromStr for RecordingPolicy {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(RecordingPolicy::Host),
            "always" => Ok(RecordingPolicy::Always),
            "off" | "none" => Ok(RecordingPolicy::Off),
            other => Err(ClientError::Config(format!(
                "unknown recording policy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the signaling server.
    /// Env: `PARLEY_SERVER_URL`
    /// Default: `http://127.0.0.1:8080`
    pub server_url: String,

    /// Env: `PARLEY_USER_ID`
    /// Default: a random `user-xxxxxxxx`
    pub user_id: UserId,

    /// Env: `PARLEY_ROOM_ID`
    /// Default: `lobby`
    pub room_id: RoomId,

    /// Start with the camera on.
    /// Env: `PARLEY_VIDEO`
    pub with_video: bool,

    /// Env: `PARLEY_RECORD` (`host` | `always` | `off`)
    pub recording: RecordingPolicy,

    /// Env: `PARLEY_HEARTBEAT_MS`
    pub heartbeat_interval: Duration,

    /// Env: `PARLEY_NEGOTIATION_TIMEOUT_MS`
    pub negotiation_timeout: Duration,

    /// Env: `PARLEY_TRACK_SWAP_GRACE_MS`
    pub track_swap_grace: Duration,

    /// Env: `PARLEY_CHUNK_MS`
    pub chunk_interval: Duration,

    /// Env: `PARLEY_UPLOAD_ATTEMPTS`
    pub upload_attempts: u32,

    /// Env: `PARLEY_UPLOAD_BASE_DELAY_MS`
    pub upload_base_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            user_id: UserId::new(format!("user-{}", &suffix[..8])),
            room_id: RoomId::new("lobby"),
            with_video: false,
            recording: RecordingPolicy::default(),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            negotiation_timeout: Duration::from_millis(NEGOTIATION_TIMEOUT_MS),
            track_swap_grace: Duration::from_millis(TRACK_SWAP_GRACE_MS),
            chunk_interval: Duration::from_millis(RECORDING_CHUNK_MS),
            upload_attempts: UPLOAD_MAX_ATTEMPTS,
            upload_base_delay: Duration::from_millis(UPLOAD_BASE_DELAY_MS),
        }
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    if let Some(val) = lookup(key) {
        match val.parse::<u64>() {
            Ok(ms) if ms > 0 => *slot = Duration::from_millis(ms),
            _ => tracing::warn!(key, value = %val, "Invalid duration, using default"),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_SERVER_URL") {
            config.server_url = url.trim_end_matches('/').to_string();
        }

        if let Some(user) = lookup("PARLEY_USER_ID").filter(|s| !s.trim().is_empty()) {
            config.user_id = UserId::new(user.trim());
        }

        if let Some(room) = lookup("PARLEY_ROOM_ID").filter(|s| !s.trim().is_empty()) {
            config.room_id = RoomId::new(room.trim());
        }

        if let Some(val) = lookup("PARLEY_VIDEO") {
            config.with_video = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        }

        if let Some(val) = lookup("PARLEY_RECORD") {
            match val.parse() {
                Ok(policy) => config.recording = policy,
                Err(e) => tracing::warn!(error = %e, "Invalid PARLEY_RECORD, using default"),
            }
        }

        millis(&lookup, "PARLEY_HEARTBEAT_MS", &mut config.heartbeat_interval);
        millis(
            &lookup,
            "PARLEY_NEGOTIATION_TIMEOUT_MS",
            &mut config.negotiation_timeout,
        );
        millis(
            &lookup,
            "PARLEY_TRACK_SWAP_GRACE_MS",
            &mut config.track_swap_grace,
        );
        millis(&lookup, "PARLEY_CHUNK_MS", &mut config.chunk_interval);
        millis(
            &lookup,
            "PARLEY_UPLOAD_BASE_DELAY_MS",
            &mut config.upload_base_delay,
        );

        if let Some(val) = lookup("PARLEY_UPLOAD_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.upload_attempts = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_UPLOAD_ATTEMPTS, using default"),
            }
        }

        config
    }

    pub fn controller(&self) -> ControllerConfig {
        let mut recording_config = RecordingConfig {
            chunk_interval: self.chunk_interval,
            ..RecordingConfig::default()
        };
        recording_config.retry.max_attempts = self.upload_attempts;
        recording_config.retry.base_delay = self.upload_base_delay;

        ControllerConfig {
            user_id: self.user_id.clone(),
            room_id: self.room_id.clone(),
            with_video: self.with_video,
            heartbeat_interval: self.heartbeat_interval,
            peer_timeouts: PeerTimeouts {
                negotiation: self.negotiation_timeout,
                swap_grace: self.track_swap_grace,
            },
            recording: self.recording,
            recording_config,
        }
    }
}
