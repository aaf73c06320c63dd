//! JSON error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sandbox_core::SandboxError;
use serde_json::json;

/// An error returned to the client as `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(error: SandboxError) -> Self {
        let status = match &error {
            SandboxError::Session(_) | SandboxError::ToolArguments(_) | SandboxError::UnknownTool(_) => {
                StatusCode::BAD_REQUEST
            }
            SandboxError::Submission(_) => StatusCode::NOT_FOUND,
            SandboxError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SandboxError::Connection(_) | SandboxError::Remote(_) | SandboxError::Model(_) => {
                StatusCode::BAD_GATEWAY
            }
            SandboxError::ModelLimit(_) | SandboxError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("Request failed ({}): {}", self.status, self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
