//! Request-level error taxonomy.
//!
//! Client errors surface as 4xx with a structured JSON body; handler
//! failures surface as 5xx with the message echoed back. The 404 route
//! fallback is the only plain-text response and lives in the server.

use hyper::StatusCode;
use thiserror::Error;

use crate::request::{HttpResponse, Reply};

/// Errors produced by middleware and route handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request: missing/invalid namespace, unreadable body.
    #[error("{0}")]
    BadRequest(String),

    /// No API key supplied.
    #[error("{0}")]
    Unauthorized(String),

    /// API key supplied but invalid.
    #[error("{0}")]
    Forbidden(String),

    /// Referenced resource (e.g. tenant namespace) does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Request body exceeded the configured size bound.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Fixed-window rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimited { retry_after: u64 },

    /// Handler failure; the message is echoed to the caller.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as a structured JSON response.
    pub fn into_response(self) -> HttpResponse {
        let body = match &self {
            ApiError::RateLimited { retry_after } => serde_json::json!({
                "error": "Rate limit exceeded",
                "retry_after": retry_after,
            }),
            other => serde_json::json!({ "error": other.to_string() }),
        };

        Reply::status(self.status()).json(&body)
    }
}

/// Errors that abort a connection without writing an HTTP response.
///
/// Returned from the per-connection service for upgrade requests that
/// must not receive a handshake; hyper tears the socket down.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Upgrade target contained `..` or control characters.
    #[error("upgrade path rejected")]
    UpgradeRejected,

    /// No WebSocket route registered for the upgrade target.
    #[error("no websocket route for path")]
    UpgradeUnmatched,
}
