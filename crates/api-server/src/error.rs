//! HTTP error envelope shared by every handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use taskflow_core::TaskflowError;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// A status code plus the JSON body sent with it. Internal failures are
/// logged and replaced with a generic message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "Authentication required")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        )
    }
}

impl From<TaskflowError> for ApiError {
    fn from(e: TaskflowError) -> Self {
        match e {
            // Identity failures never say why.
            TaskflowError::Unauthorized(_) => Self::unauthorized(),
            TaskflowError::Forbidden(msg) => Self::forbidden(msg),
            TaskflowError::NotFound { entity, .. } => Self::new(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{entity} not found"),
            ),
            TaskflowError::Conflict(msg) => Self::new(StatusCode::CONFLICT, "conflict", msg),
            TaskflowError::Validation(msg) => Self::bad_request(msg),
            other => {
                error!(error = %other, "Request failed");
                metrics::counter!("api.errors").increment(1);
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
