//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_HTTP_PORT, ENDED_CALL_RETENTION_MS, HEARTBEAT_SWEEP_MS, HEARTBEAT_TIMEOUT_MS,
    MAX_RECORDING_SIZE,
};
use parley_shared::RoomId;

use crate::coordinator::CoordinatorConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Directory where uploaded call recordings are written.
    /// Env: `RECORDING_STORAGE_PATH`
    /// Default: `./recordings`
    pub recording_storage_path: PathBuf,

    /// Maximum recording artifact size in bytes.
    /// Env: `MAX_RECORDING_SIZE`
    /// Default: 256 MiB
    pub max_recording_size: usize,

    /// Liveness window before a silent participant is removed.
    /// Env: `HEARTBEAT_TIMEOUT_MS`
    pub heartbeat_timeout: Duration,

    /// Period of each room's liveness sweep.
    /// Env: `HEARTBEAT_SWEEP_MS`
    pub heartbeat_sweep: Duration,

    /// How long an ended call still accepts leaves and recording uploads.
    /// Env: `ENDED_CALL_RETENTION_MS`
    /// Default: 2 minutes
    pub ended_call_retention: Duration,

    /// Rooms opened at startup.
    /// Env: `ROOMS` (comma-separated)
    pub rooms: Vec<RoomId>,

    /// Maximum participants per call (0 = unlimited).
    /// Env: `MAX_PARTICIPANTS`
    /// Default: `0`
    pub max_participants: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            recording_storage_path: PathBuf::from("./recordings"),
            max_recording_size: MAX_RECORDING_SIZE,
            heartbeat_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            heartbeat_sweep: Duration::from_millis(HEARTBEAT_SWEEP_MS),
            ended_call_retention: Duration::from_millis(ENDED_CALL_RETENTION_MS),
            rooms: Vec::new(),
            max_participants: 0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("RECORDING_STORAGE_PATH") {
            config.recording_storage_path = PathBuf::from(path);
        }

        if let Some(val) = lookup("MAX_RECORDING_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_recording_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_RECORDING_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("HEARTBEAT_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.heartbeat_timeout = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid HEARTBEAT_TIMEOUT_MS, using default"),
            }
        }

        if let Some(val) = lookup("HEARTBEAT_SWEEP_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.heartbeat_sweep = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid HEARTBEAT_SWEEP_MS, using default"),
            }
        }

        if let Some(val) = lookup("ENDED_CALL_RETENTION_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.ended_call_retention = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid ENDED_CALL_RETENTION_MS, using default"),
            }
        }

        if let Some(val) = lookup("ROOMS") {
            config.rooms = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(RoomId::new)
                .collect();
        }

        if let Some(val) = lookup("MAX_PARTICIPANTS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_participants = n;
            } else {
                tracing::warn!(value = %val, "Invalid MAX_PARTICIPANTS, using default");
            }
        }

        config
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            liveness_window: self.heartbeat_timeout,
            sweep_interval: self.heartbeat_sweep,
            max_participants: self.max_participants,
            ended_call_retention: self.ended_call_retention,
        }
    }
}
