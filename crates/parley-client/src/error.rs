use thiserror::Error;

use parley_media::DeviceError;
use parley_shared::CallError;

use crate::state::CallState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Not allowed while the call is {0}")]
    InvalidState(CallState),

    #[error("Call controller stopped")]
    ControllerStopped,

    #[error("Configuration error: {0}")]
    Config(String),
}
