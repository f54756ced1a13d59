//! Unified error handling for the gateway.
//!
//! This module provides a centralized error type system that eliminates
//! the need for modules to depend on each other for error handling, and
//! carries the HTTP status each error class renders as.

use std::fmt;

use http::StatusCode;
use serde_json::json;

/// Unified error types for the gateway
#[derive(Debug)]
pub enum GatewayError {
    /// Configuration-related errors
    Configuration(String),

    /// Network and I/O errors
    Network(std::io::Error),

    /// Malformed or incomplete client input
    BadRequest(String),

    /// Authentication failures
    Unauthorized(String),

    /// Unknown cluster, database or route
    NotFound(String),

    /// Upstream asked us to back off
    Overloaded(String),

    /// Upstream or shared store not reachable
    Unavailable(String),

    /// Deadline exceeded while calls were outstanding
    Timeout(String),

    /// Control-plane operation finished with a non-success status
    Upstream {
        status: StatusCode,
        message: String,
        issues: Vec<serde_json::Value>,
    },

    /// Internal system errors
    Internal(String),

    /// Pingora framework errors
    Pingora(pingora_error::Error),
}

impl GatewayError {
    /// HTTP status this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Overloaded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Pingora(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON error body: `{"message": ...}` plus the upstream issue list when present.
    pub fn to_json_body(&self) -> Vec<u8> {
        let body = match self {
            GatewayError::Upstream {
                message, issues, ..
            } if !issues.is_empty() => {
                json!({"message": message, "issues": issues})
            }
            other => json!({"message": other.to_string()}),
        };
        body.to_string().into_bytes()
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            GatewayError::Network(err) => write!(f, "Network error: {err}"),
            GatewayError::BadRequest(msg) => write!(f, "Bad request: {msg}"),
            GatewayError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            GatewayError::NotFound(msg) => write!(f, "Not found: {msg}"),
            GatewayError::Overloaded(msg) => write!(f, "Overloaded: {msg}"),
            GatewayError::Unavailable(msg) => write!(f, "Unavailable: {msg}"),
            GatewayError::Timeout(msg) => write!(f, "Deadline exceeded: {msg}"),
            GatewayError::Upstream { message, .. } => write!(f, "{message}"),
            GatewayError::Internal(msg) => write!(f, "Internal error: {msg}"),
            GatewayError::Pingora(err) => write!(f, "Pingora error: {err}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Network(err) => Some(err),
            GatewayError::Pingora(err) => Some(err),
            _ => None,
        }
    }
}

// Error conversions
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Network(err)
    }
}

impl From<pingora_error::Error> for GatewayError {
    fn from(err: pingora_error::Error) -> Self {
        GatewayError::Pingora(err)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::BadRequest(format!("invalid JSON: {err}"))
    }
}

impl From<GatewayError> for Box<pingora_error::Error> {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Pingora(pingora_err) => Box::new(pingora_err),
            _ => pingora_error::Error::explain(
                pingora_error::ErrorType::InternalError,
                err.to_string(),
            ),
        }
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::Overloaded("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Timeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_shape() {
        let err = GatewayError::NotFound("cluster foo".into());
        let body: serde_json::Value =
            serde_json::from_slice(&err.to_json_body()).unwrap();
        assert_eq!(body["message"], "Not found: cluster foo");

        let err = GatewayError::Upstream {
            status: StatusCode::BAD_REQUEST,
            message: "precondition failed".into(),
            issues: vec![serde_json::json!({"message": "database unknown"})],
        };
        let body: serde_json::Value =
            serde_json::from_slice(&err.to_json_body()).unwrap();
        assert_eq!(body["issues"][0]["message"], "database unknown");
    }
}
