//! The `{error, message}` shape and status-code table of spec §7.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::rest::dto::ErrorResponse;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid id")]
    InvalidId,
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("invalid email: {0}")]
    InvalidEmail(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("missing query")]
    MissingQuery,
    #[error("missing account")]
    MissingAccount,
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("sync already running for {0}")]
    SyncAlreadyRunning(String),
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("scheduler unavailable")]
    SchedulerUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // The real error text is never placed in the `error` field, and for
        // internal failures not even in `message` — only logged server-side.
        let (status, code, message) = match &self {
            ApiError::InvalidId => (StatusCode::BAD_REQUEST, "invalid_id", None),
            ApiError::InvalidJson(m) => (StatusCode::BAD_REQUEST, "invalid_json", Some(m.clone())),
            ApiError::InvalidEmail(m) => (StatusCode::BAD_REQUEST, "invalid_email", Some(m.clone())),
            ApiError::InvalidSchedule(m) => {
                (StatusCode::BAD_REQUEST, "invalid_schedule", Some(m.clone()))
            }
            ApiError::InvalidToken(m) => (StatusCode::BAD_REQUEST, "invalid_token", Some(m.clone())),
            ApiError::MissingQuery => (StatusCode::BAD_REQUEST, "missing_query", None),
            ApiError::MissingAccount => (StatusCode::BAD_REQUEST, "missing_account", None),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", None),
            ApiError::UnknownAccount(_) => (StatusCode::NOT_FOUND, "not_found", None),
            ApiError::SyncAlreadyRunning(email) => (
                StatusCode::CONFLICT,
                "sync_error",
                Some(format!("sync already running for {email}")),
            ),
            ApiError::RateLimitExceeded => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded", None)
            }
            ApiError::StoreUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", None)
            }
            ApiError::SchedulerUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", None)
            }
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let body = ErrorResponse {
            error: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
