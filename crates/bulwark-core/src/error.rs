//! Error taxonomy shared by every resilience primitive.

use std::time::Duration;
use thiserror::Error;

use crate::circuit_breaker::CircuitState;

/// HTTP status codes that are treated as a failed, retryable attempt.
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Whether a completed exchange with this status should be retried.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// Errors surfaced by the breaker, retry executor, pool and health checks.
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// The breaker short-circuited the call. Always generated locally.
    #[error("circuit breaker '{name}' is {state}")]
    CircuitOpen { name: String, state: CircuitState },

    #[error("connection pool exhausted: {active}/{max} clients active")]
    PoolExhausted { active: usize, max: usize },

    #[error("HTTP {status}: {text}")]
    HttpStatus { status: u16, text: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation failed: {0}")]
    Operation(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ResilienceError {
    /// Wrap an arbitrary operation failure.
    pub fn operation(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Operation(err.into())
    }

    /// Build an HTTP status error from a numeric code.
    pub fn http_status(status: u16, text: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            text: text.into(),
        }
    }

    /// Default retryability used by [`RetryConfig`](crate::RetryConfig).
    ///
    /// Cancellation and circuit-open errors are never retried; HTTP status
    /// errors only when the code is one of [`RETRYABLE_STATUS_CODES`].
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::CircuitOpen { .. } => false,
            Self::HttpStatus { status, .. } => is_retryable_status(*status),
            Self::PoolExhausted { .. }
            | Self::Timeout(_)
            | Self::Transport(_)
            | Self::Operation(_) => true,
        }
    }

    /// Status code carried by an [`HttpStatus`](Self::HttpStatus) error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status_codes() {
        for status in RETRYABLE_STATUS_CODES {
            assert!(is_retryable_status(status));
        }
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(501));
    }

    #[test]
    fn test_default_retryability() {
        assert!(ResilienceError::Transport("reset".to_string()).is_retryable());
        assert!(ResilienceError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ResilienceError::operation("boom").is_retryable());
        assert!(ResilienceError::http_status(503, "Service Unavailable").is_retryable());

        assert!(!ResilienceError::Cancelled.is_retryable());
        assert!(!ResilienceError::http_status(404, "Not Found").is_retryable());
        assert!(!ResilienceError::CircuitOpen {
            name: "github".to_string(),
            state: CircuitState::Open,
        }
        .is_retryable());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = ResilienceError::PoolExhausted { active: 4, max: 4 };
        assert_eq!(err.to_string(), "connection pool exhausted: 4/4 clients active");

        let err = ResilienceError::CircuitOpen {
            name: "x".to_string(),
            state: CircuitState::Open,
        };
        assert_eq!(err.to_string(), "circuit breaker 'x' is open");
    }
}
