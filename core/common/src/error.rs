//! Common error types for docmirror.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for docmirror operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection to the remote could not be established or was dropped.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call exceeded its hard timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The remote asked us to slow down.
    #[error("Rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The remote answered with a 5xx status.
    #[error("Remote server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credential rejected by the remote.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Credential accepted but access denied.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Payload did not have the expected shape.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Any other non-retryable remote status.
    #[error("Remote rejected request with status {status}: {message}")]
    Remote { status: u16, message: String },

    /// Calls to this target are being rejected locally.
    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The scheduler task is gone or refused the request.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

/// Coarse classification that drives retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help.
    Permanent,
    /// Synthetic rejection from the circuit breaker.
    CircuitOpen,
    /// Failure on our side of the boundary.
    Local,
}

impl Error {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Network(_)
            | Error::Timeout(_)
            | Error::RateLimited { .. }
            | Error::Server { .. } => ErrorClass::Transient,
            Error::NotFound(_)
            | Error::Authentication(_)
            | Error::PermissionDenied(_)
            | Error::InvalidInput(_)
            | Error::Malformed(_)
            | Error::Remote { .. } => ErrorClass::Permanent,
            Error::CircuitOpen(_) => ErrorClass::CircuitOpen,
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) | Error::Scheduler(_) => {
                ErrorClass::Local
            }
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this is a circuit breaker rejection rather than a real failure.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen(_))
    }

    /// Minimum wait requested by the remote, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(5)).is_transient());
        assert!(Error::RateLimited { retry_after: None }.is_transient());
        assert!(Error::Server {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_permanent_classification() {
        assert_eq!(Error::NotFound("x".to_string()).class(), ErrorClass::Permanent);
        assert_eq!(
            Error::Authentication("bad token".to_string()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            Error::Remote {
                status: 409,
                message: String::new()
            }
            .class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_circuit_open_is_distinct() {
        let err = Error::CircuitOpen("tasks".to_string());
        assert!(err.is_circuit_open());
        assert!(!err.is_transient());
        assert_eq!(err.class(), ErrorClass::CircuitOpen);
    }

    #[test]
    fn test_retry_after_hint() {
        let err = Error::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(Error::Network("x".to_string()).retry_after(), None);
    }
}
