pub mod admin;
pub mod batches;
pub mod files;
pub mod health;
pub mod metrics;

// Common response types
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::errors::{AdmissionError, StoreError, ValidationError};
use serde::Serialize;

/// Standard API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub trace_id: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = match self.error.as_str() {
            "not_found" => StatusCode::NOT_FOUND,
            "validation_error" => StatusCode::BAD_REQUEST,
            "invalid_state" => StatusCode::BAD_REQUEST,
            "queue_full" => StatusCode::TOO_MANY_REQUESTS,
            "gpu_unhealthy" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self)).into_response()
    }
}

impl From<AdmissionError> for ErrorResponse {
    fn from(err: AdmissionError) -> Self {
        let code = match &err {
            AdmissionError::QueueFull { .. } | AdmissionError::TooManyQueuedRequests { .. } => {
                "queue_full"
            }
            AdmissionError::GpuUnhealthy(_) => "gpu_unhealthy",
            AdmissionError::InvalidLine { .. }
            | AdmissionError::DuplicateCustomId { .. }
            | AdmissionError::EmptyFile
            | AdmissionError::TooManyRequests { .. }
            | AdmissionError::InputFileNotFound(_)
            | AdmissionError::InvalidField { .. } => "validation_error",
            AdmissionError::Store(StoreError::NotFound(_)) => "not_found",
            AdmissionError::Store(_) | AdmissionError::Io(_) => "internal_error",
        };
        ErrorResponse::new(code, err.to_string())
    }
}

impl From<StoreError> for ErrorResponse {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::NotFound(_) => "not_found",
            StoreError::InvalidTransition { .. } => "invalid_state",
            _ => "internal_error",
        };
        ErrorResponse::new(code, err.to_string())
    }
}

impl From<ValidationError> for ErrorResponse {
    fn from(err: ValidationError) -> Self {
        ErrorResponse::new("validation_error", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_for(code: &str) -> StatusCode {
        ErrorResponse::new(code, "m").into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for("not_found"), StatusCode::NOT_FOUND);
        assert_eq!(status_for("validation_error"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("invalid_state"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("queue_full"), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for("gpu_unhealthy"), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for("internal_error"), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_queue_full_maps_to_429() {
        let err = AdmissionError::QueueFull { active: 20, max: 20 };
        let response: ErrorResponse = err.into();
        assert_eq!(response.error, "queue_full");
    }

    #[test]
    fn test_gpu_unhealthy_maps_to_503() {
        let err = AdmissionError::GpuUnhealthy("GPU memory at 97.0%".to_string());
        let response: ErrorResponse = err.into();
        assert_eq!(response.error, "gpu_unhealthy");
        assert!(response.message.contains("97.0%"));
    }

    #[test]
    fn test_invalid_transition_maps_to_400() {
        let err = StoreError::InvalidTransition {
            batch_id: "batch_x".to_string(),
            detail: "cancel rejected in status 'completed'".to_string(),
        };
        let response: ErrorResponse = err.into();
        assert_eq!(response.error, "invalid_state");
    }
}
