//! # parley-server
//!
//! Signaling coordinator for parley calls.
//!
//! This binary provides:
//! - **Per-room coordinators** that own each call's roster, relay
//!   offer/answer/candidate envelopes and detect silent participants
//! - **REST API** (axum) for opening rooms, joining, leaving, ending and
//!   polling roster snapshots
//! - **WebSocket signaling channel** per participant
//! - **Recording store** that accepts the finished mixed-audio artifact of
//!   each call

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_server::api::{self, AppState};
use parley_server::{Coordinator, RecordingStore, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.max_participants == 0 {
        info!("No participant cap configured, calls run as full mesh");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let recordings =
        RecordingStore::new(config.recording_storage_path.clone(), config.max_recording_size)
            .await?;

    let coordinator = Coordinator::new(config.coordinator());
    for room in &config.rooms {
        coordinator.open_room(room.clone()).await;
    }

    let http_addr = config.http_addr;
    let app_state = AppState::new(coordinator, recordings, config);

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
