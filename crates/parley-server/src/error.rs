use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::{CallError, CallId};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("Recording not found: {0}")]
    RecordingNotFound(CallId),

    #[error("Recording too large: {size} bytes (max {max})")]
    RecordingTooLarge { size: usize, max: usize },

    #[error("Recording storage error: {0}")]
    RecordingStorage(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    fn code(&self) -> &'static str {
        match self {
            ServerError::Call(e) => e.code(),
            ServerError::RecordingNotFound(_) => "recording_not_found",
            ServerError::RecordingTooLarge { .. } => "recording_too_large",
            ServerError::RecordingStorage(_) => "recording_storage",
            ServerError::BadRequest(_) => "bad_request",
            ServerError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Call(e) => {
                let status = match e {
                    CallError::RoomNotFound(_) | CallError::CallNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    CallError::AlreadyJoined(_) | CallError::RoomFull(_) => StatusCode::CONFLICT,
                    CallError::NotAParticipant(_) | CallError::Forbidden(_) => {
                        StatusCode::FORBIDDEN
                    }
                    CallError::Malformed(_) => StatusCode::BAD_REQUEST,
                    CallError::CoordinatorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                    CallError::Transport(_) => StatusCode::BAD_GATEWAY,
                };
                (status, self.to_string())
            }
            ServerError::RecordingNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::RecordingTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::RecordingStorage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Recording storage error".to_string(),
            ),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
