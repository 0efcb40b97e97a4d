//! Custom error types for scholarfeed.
//!
//! This module defines all error types used throughout the service and the
//! mapping from errors to HTTP responses. All functions return
//! `Result<T, ScholarError>` instead of using `unwrap()`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

/// Main error type for scholarfeed operations.
///
/// Uses `thiserror` for ergonomic error handling and automatic `Display`
/// implementation. Each variant maps to exactly one HTTP status code.
#[derive(Debug, Error)]
pub enum ScholarError {
    /// Malformed input, surfaced verbatim to the caller
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or invalid session
    #[error("Authentication required")]
    Unauthenticated,

    /// Operation conflicts with an invariant (e.g. deleting the likes folder)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Paper, folder, or follow target missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate follow or folder
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upstream 5xx or network error after retries
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// Upstream 429 after retries; retry hint in seconds when known
    #[error("Rate limited, retry after {}s", .0.unwrap_or(60))]
    RateLimited(Option<u64>),

    /// Upstream call exceeded its deadline
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Per-user write conflict that survived retries
    #[error("Store conflict for user {0}")]
    StoreConflict(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else; never leaks internals to the response body
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using `ScholarError`
pub type Result<T> = std::result::Result<T, ScholarError>;

impl ScholarError {
    /// HTTP status for this error per the API contract.
    pub fn status(&self) -> StatusCode {
        match self {
            ScholarError::Validation(_) => StatusCode::BAD_REQUEST,
            ScholarError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ScholarError::Forbidden(_) => StatusCode::FORBIDDEN,
            ScholarError::NotFound(_) => StatusCode::NOT_FOUND,
            ScholarError::Conflict(_) => StatusCode::CONFLICT,
            ScholarError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ScholarError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ScholarError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ScholarError::StoreConflict(_)
            | ScholarError::Config(_)
            | ScholarError::Json(_)
            | ScholarError::Io(_)
            | ScholarError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for ScholarError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ScholarError::UpstreamTimeout(e.to_string())
        } else {
            ScholarError::Upstream(e.to_string())
        }
    }
}

impl IntoResponse for ScholarError {
    fn into_response(self) -> Response {
        let status = self.status();

        // 5xx details stay in the log; the body carries a correlation id only.
        let body = if status.is_server_error() {
            let correlation_id = uuid::Uuid::new_v4().to_string();
            error!(correlation_id = %correlation_id, error = %self, "Request failed");
            serde_json::json!({
                "error": "internal error",
                "correlation_id": correlation_id,
            })
        } else {
            serde_json::json!({ "error": self.to_string() })
        };

        let mut response = (status, Json(body)).into_response();
        if let ScholarError::RateLimited(secs) = self {
            if let Ok(header) = secs.unwrap_or(60).to_string().parse() {
                response.headers_mut().insert("Retry-After", header);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ScholarError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ScholarError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ScholarError::Forbidden("likes".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ScholarError::NotFound("W1".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ScholarError::Conflict("follow".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ScholarError::RateLimited(Some(5)).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ScholarError::Upstream("boom".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ScholarError::UpstreamTimeout("slow".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_rate_limited_display_defaults_to_60() {
        assert_eq!(
            ScholarError::RateLimited(None).to_string(),
            "Rate limited, retry after 60s"
        );
        assert_eq!(
            ScholarError::RateLimited(Some(5)).to_string(),
            "Rate limited, retry after 5s"
        );
    }
}
