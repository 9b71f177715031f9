use crate::error::StatsError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// API error type with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// The event could not be stored right now; the client may retry.
    Unavailable(String),
    Internal(String),
    Stats(StatsError),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Bad request: {msg}"),
            Self::NotFound(msg) => write!(f, "Not found: {msg}"),
            Self::Unavailable(msg) => write!(f, "Unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
            Self::Stats(e) => write!(f, "Stats error: {e}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Unavailable(msg) => {
                tracing::warn!(reason = %msg, "Request rejected as unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            Self::Stats(e) => {
                tracing::error!(error = %e, "Stats store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

impl From<StatsError> for ApiError {
    fn from(e: StatsError) -> Self {
        match e {
            StatsError::InvalidInput(msg) => Self::BadRequest(msg),
            StatsError::Unresolved { dimension, reason } => {
                Self::Unavailable(format!("{dimension} dimension unresolved: {reason}"))
            }
            other => Self::Stats(other),
        }
    }
}
