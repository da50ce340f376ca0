// Signaling coordinator, HTTP/WebSocket surface and recording store.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod recording_store;
pub mod room;

pub use api::{build_router, AppState};
pub use config::ServerConfig;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::ServerError;
pub use recording_store::RecordingStore;
