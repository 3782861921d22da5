//! Error types for the auth token middleware

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the middleware
pub type Result<T> = std::result::Result<T, Error>;

/// Middleware errors.
///
/// Only [`crate::middleware`] turns these into HTTP responses; every other
/// component either recovers locally or propagates.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller's token is missing, malformed, expired, revoked or failed
    /// signature verification
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The identity service could not be used to reach a decision (no admin
    /// token, unparsable response, unexpected status)
    #[error("Identity service error: {0}")]
    Service(String),

    /// Transport failure after retries were exhausted
    #[error("Network error: {0}")]
    Network(String),

    /// Operator configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid-token error
    pub fn invalid_token(reason: impl Into<String>) -> Self {
        Self::InvalidToken(reason.into())
    }

    /// Create a service error
    pub fn service(reason: impl Into<String>) -> Self {
        Self::Service(reason.into())
    }

    /// HTTP status the caller sees for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::Service(_) | Self::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Io(_) | Self::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error says something about the caller's token rather than
    /// about the middleware's ability to decide
    #[must_use]
    pub fn is_invalid_token(&self) -> bool {
        matches!(self, Self::InvalidToken(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::invalid_token("expired").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::service("no admin token").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Network("timed out".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Config("bad".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_invalid_token_classification() {
        assert!(Error::invalid_token("revoked").is_invalid_token());
        assert!(!Error::service("x").is_invalid_token());
        assert!(!Error::Network("x".into()).is_invalid_token());
    }
}
