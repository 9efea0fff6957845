//! Request-facing error taxonomy with HTTP status mapping.
//!
//! Relay delivery failures are deliberately absent: they are logged inside
//! the relay task and never surfaced to the request that triggered them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Inbound report that is not a JSON object. The report is dropped.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Bad control-request input (pin name or state). No side effects.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Store persistence failure; the triggering pipeline halts here.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl HubError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedPayload(_) | Self::InvalidState(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Io(_) | Self::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
