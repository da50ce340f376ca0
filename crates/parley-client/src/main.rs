//! # parley-call
//!
//! Headless call participant. Joins `PARLEY_ROOM_ID` on `PARLEY_SERVER_URL`
//! with the default microphone, negotiates a WebRTC link to every other
//! participant, and stays in the call until Ctrl+C. When it records, the
//! mixed audio is uploaded to the server on leave.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_client::{
    CallController, CallEvent, CallServices, ClientConfig, HttpRecordingSink, WsTransport,
};
use parley_media::audio::{AudioConfig, CpalDevice};
use parley_media::rtc::{RtcConfig, RtcFactory};
use parley_media::RecordingStatus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_client=debug,parley_media=debug")),
        )
        .init();

    info!("Starting parley-call v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Wire up signaling, media and recording
    // -----------------------------------------------------------------------
    let services = CallServices {
        signaling: Arc::new(WsTransport::new(&config.server_url)?),
        media: Arc::new(RtcFactory::new(RtcConfig::default())),
        device: Arc::new(CpalDevice::new(AudioConfig::default())),
        sink: Arc::new(HttpRecordingSink::new(&config.server_url)?),
    };

    let (call, controller) = CallController::spawn(config.controller(), services);
    let mut events = call.subscribe();

    let joined = call
        .join()
        .await
        .with_context(|| format!("joining room {}", config.room_id))?;
    info!(
        call = %joined.call_id,
        role = ?joined.role,
        participants = joined.roster.len(),
        "In call, press Ctrl+C to leave"
    );

    // -----------------------------------------------------------------------
    // 4. Follow the call until it ends or the user leaves
    // -----------------------------------------------------------------------
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::CallEnded(reason)) => {
                    info!(?reason, "Call ended");
                }
                Ok(CallEvent::RecordingFinished(status)) => report_recording(&status),
                Ok(CallEvent::StateChanged(state)) if state.can_join() => break,
                Ok(event) => info!(event = event.name(), ?event, "Call event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped call events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving call");
                if let Some(status) = call.leave().await? {
                    report_recording(&status);
                }
                break;
            }
        }
    }

    drop(events);
    drop(call);
    controller.await?;
    Ok(())
}

fn report_recording(status: &RecordingStatus) {
    match status {
        RecordingStatus::Uploaded {
            location,
            attempts,
            duration,
        } => info!(%location, attempts, ?duration, "Recording uploaded"),
        RecordingStatus::NoRecording => info!("Nothing was recorded"),
        RecordingStatus::Unavailable {
            attempts,
            last_error,
        } => warn!(attempts, %last_error, "Recording unavailable"),
    }
}
