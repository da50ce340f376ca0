pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod sink;
pub mod state;
pub mod transport;

#[cfg(test)]
mod scenarios;

pub use config::{ClientConfig, RecordingPolicy};
pub use controller::{CallController, CallHandle, CallServices, ControllerConfig};
pub use error::ClientError;
pub use events::CallEvent;
pub use sink::HttpRecordingSink;
pub use state::{CallSnapshot, CallState, PeerSummary};
pub use transport::WsTransport;
