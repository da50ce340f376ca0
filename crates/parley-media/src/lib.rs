// Media plumbing for a call: capture, peer links, mixing and recording.

pub mod audio;
pub mod capture;
pub mod mixer;
pub mod negotiation;
pub mod peer;
pub mod recording;
pub mod rtc;
pub mod sim;

pub use capture::{CapabilityLoss, CaptureDevice, DeviceError, LocalTrack, MediaCapture, TrackKind, TrackSwap};
pub use mixer::{AudioTap, MixingGraph, TapSlot};
pub use peer::{
    LinkContext, MediaTransport, PeerConnectionManager, PeerEvent, PeerEventKind, PeerNotice,
    PeerTimeouts, TransportError, TransportFactory,
};
pub use recording::{
    RecordingConfig, RecordingPipeline, RecordingSink, RecordingStatus, RetryPolicy, SinkError,
};
