use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::job::JobState;

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SynthesisError>;

impl SynthesisError {
    fn status_code(&self) -> StatusCode {
        match self {
            SynthesisError::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SynthesisError::JobNotFound(_) => StatusCode::NOT_FOUND,
            SynthesisError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SynthesisError::QueueUnavailable(_)
            | SynthesisError::StoreUnavailable(_)
            | SynthesisError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            SynthesisError::Configuration(_) | SynthesisError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SynthesisError::InvalidPayload(_) => "invalid_payload",
            SynthesisError::QueueUnavailable(_) => "queue_unavailable",
            SynthesisError::StoreUnavailable(_) => "store_unavailable",
            SynthesisError::JobNotFound(_) => "not_found",
            SynthesisError::InvalidTransition { .. } => "invalid_transition",
            SynthesisError::ShuttingDown => "shutting_down",
            SynthesisError::Configuration(_) => "configuration_error",
            SynthesisError::Serialization(_) => "internal_error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &SynthesisError) -> Self {
        Self::new(err.kind(), &err.to_string(), err.status_code().as_u16())
    }
}

impl IntoResponse for SynthesisError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(ErrorResponse::from_error(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_payload_maps_to_422() {
        let err = SynthesisError::InvalidPayload("missing field `guild_id`".into());
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.code, 422);
        assert_eq!(body.error, "invalid_payload");
        assert!(body.message.contains("guild_id"));
    }

    #[test]
    fn test_queue_unavailable_maps_to_503() {
        let err = SynthesisError::QueueUnavailable("connection refused".into());
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
