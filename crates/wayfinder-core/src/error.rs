use std::time::Duration;

use thiserror::Error;

use crate::error_handler::Severity;

/// Application-wide error types for Wayfinder.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// HTTP request failed with a non-transport error (bad status, bad body).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The source rejected the request because of its rate limit or quota.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// The source refused our credentials (401/403).
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// The source answered but is not serving (502/503/504).
    #[error("Service unavailable: {0}")]
    SourceUnavailable(String),

    /// A payload (CSV, JSON, HTML) could not be parsed into raw records.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A single record failed validation. Never job-fatal.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Calls to the source are short-circuited by its breaker.
    #[error("Circuit breaker open for source: {source_name} (retry after {}s)", retry_after.as_secs())]
    CircuitOpen {
        source_name: String,
        retry_after: Duration,
    },

    /// The persistence collaborator failed.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Invalid configuration, detected at construction.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No adapter is registered under the requested name.
    #[error("No adapter found for source: {0}")]
    UnknownSource(String),

    /// The job was cancelled at a checkpoint.
    #[error("Job cancelled")]
    Cancelled,

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::SerializationError(e.to_string())
    }
}

impl From<csv::Error> for AppError {
    fn from(e: csv::Error) -> Self {
        AppError::ParseError(e.to_string())
    }
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::SourceUnavailable(_)
            | AppError::CircuitOpen { .. } => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Severity used by the error handler and the circuit breaker.
    ///
    /// Typed variants map directly; anything else falls back to the
    /// message heuristics in [`Severity::classify`].
    pub fn severity(&self) -> Severity {
        match self {
            AppError::AuthError(_) => Severity::Critical,
            AppError::RateLimitExceeded | AppError::SourceUnavailable(_) => Severity::High,
            AppError::NetworkError(_) | AppError::Timeout(_) => Severity::Medium,
            AppError::ValidationError(_) | AppError::Cancelled => Severity::Low,
            other => Severity::classify(&other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(AppError::SourceUnavailable("503".into()).is_retryable());
        assert!(!AppError::AuthError("401".into()).is_retryable());
        assert!(!AppError::ParseError("bad csv".into()).is_retryable());
    }

    #[test]
    fn test_typed_severity() {
        assert_eq!(AppError::AuthError("x".into()).severity(), Severity::Critical);
        assert_eq!(AppError::RateLimitExceeded.severity(), Severity::High);
        assert_eq!(AppError::Timeout(5).severity(), Severity::Medium);
        assert_eq!(AppError::ValidationError("x".into()).severity(), Severity::Low);
    }

    #[test]
    fn test_message_severity_fallback() {
        let err = AppError::HttpError("HTTP 403 Forbidden".into());
        assert_eq!(err.severity(), Severity::Critical);
        let err = AppError::Generic("quota exceeded for today".into());
        assert_eq!(err.severity(), Severity::High);
        let err = AppError::ParseError("unexpected token".into());
        assert_eq!(err.severity(), Severity::Low);
    }
}
