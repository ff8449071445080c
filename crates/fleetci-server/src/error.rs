//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleetci_scheduler::{CronError, DispatchError};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<fleetci_core::Error> for ApiError {
    fn from(err: fleetci_core::Error) -> Self {
        match err {
            fleetci_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            fleetci_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            fleetci_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound(_) | DispatchError::UnknownAgent(_) => {
                ApiError::NotFound(err.to_string())
            }
            DispatchError::Duplicate(_) => ApiError::Conflict(err.to_string()),
            DispatchError::Queue(_) => ApiError::BadRequest(err.to_string()),
            DispatchError::NoAgent | DispatchError::ShuttingDown => {
                ApiError::Unavailable(err.to_string())
            }
        }
    }
}

impl From<CronError> for ApiError {
    fn from(err: CronError) -> Self {
        match err {
            CronError::InvalidExpression { .. } | CronError::InvalidTimezone(_) => {
                ApiError::BadRequest(err.to_string())
            }
            CronError::Store(inner) => inner.into(),
        }
    }
}
