//! Error types for the VIBEZEN recovery layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Main error type for the recovery layer.
///
/// Gating errors (`CircuitOpen`, `Resource`) are produced by this crate before
/// an operation runs. All other variants are what protected operations and
/// their collaborators report, and are passed through unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryError {
    /// The named circuit breaker is rejecting calls
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        name: String,
        /// Remaining cool-down before a probe is allowed, when known
        retry_after: Option<Duration>,
    },

    /// A resource gate (memory, CPU, concurrency, rate) blocked execution
    #[error("Resource error: {message}")]
    Resource {
        /// Which gate failed
        message: String,
    },

    /// The operation did not finish before its deadline
    #[error("Timeout: {message}")]
    Timeout {
        /// Error message describing the timeout
        message: String,
    },

    /// Connection-level failure talking to a collaborator
    #[error("Connection error: {message}")]
    Connection {
        /// Error message describing the connection issue
        message: String,
    },

    /// Upstream rate limit reported by a provider
    #[error("Rate limit error: {message}")]
    RateLimit {
        /// Error message describing the rate limit issue
        message: String,
        /// Duration to wait before retrying (if provided upstream)
        retry_after: Option<Duration>,
    },

    /// Error returned by an AI provider
    #[error("Provider '{provider}' error: {message}")]
    Provider {
        /// Provider name
        provider: String,
        /// Error message from the provider
        message: String,
        /// HTTP status code, when the provider reported one
        status_code: Option<u16>,
    },

    /// Invalid input or value
    #[error("Validation error: {message}")]
    Validation {
        /// Error message describing the validation issue
        message: String,
    },

    /// A fallback handler could not produce a result
    #[error("Fallback error: {message}")]
    Fallback {
        /// Error message describing the fallback failure
        message: String,
    },

    /// Configuration error (invalid settings, unregistered strategies)
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Internal error (unexpected conditions, library bugs)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal issue
        message: String,
    },
}

/// Closed set of error tags used by retry and breaker policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// [`RecoveryError::CircuitOpen`]
    CircuitOpen,
    /// [`RecoveryError::Resource`]
    Resource,
    /// [`RecoveryError::Timeout`]
    Timeout,
    /// [`RecoveryError::Connection`]
    Connection,
    /// [`RecoveryError::RateLimit`]
    RateLimit,
    /// [`RecoveryError::Provider`]
    Provider,
    /// [`RecoveryError::Validation`]
    Validation,
    /// [`RecoveryError::Fallback`]
    Fallback,
    /// [`RecoveryError::Configuration`]
    Configuration,
    /// [`RecoveryError::Internal`]
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Resource => "resource",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Provider => "provider",
            ErrorKind::Validation => "validation",
            ErrorKind::Fallback => "fallback",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Outcome of classifying an error against a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; the retry handler may try again
    Retryable(ErrorKind),
    /// Propagates on first occurrence
    Fatal(ErrorKind),
}

impl ErrorClass {
    /// Returns true for [`ErrorClass::Retryable`]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Retryable(_))
    }

    /// The tag that was classified
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorClass::Retryable(kind) | ErrorClass::Fatal(kind) => *kind,
        }
    }
}

impl RecoveryError {
    /// Returns the closed classification tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecoveryError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            RecoveryError::Resource { .. } => ErrorKind::Resource,
            RecoveryError::Timeout { .. } => ErrorKind::Timeout,
            RecoveryError::Connection { .. } => ErrorKind::Connection,
            RecoveryError::RateLimit { .. } => ErrorKind::RateLimit,
            RecoveryError::Provider { .. } => ErrorKind::Provider,
            RecoveryError::Validation { .. } => ErrorKind::Validation,
            RecoveryError::Fallback { .. } => ErrorKind::Fallback,
            RecoveryError::Configuration { .. } => ErrorKind::Configuration,
            RecoveryError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if this error was produced by a gate of this crate rather
    /// than by the protected operation.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RecoveryError::CircuitOpen { .. } | RecoveryError::Resource { .. }
        )
    }

    /// Returns the retry-after hint if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RecoveryError::CircuitOpen { retry_after, .. }
            | RecoveryError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        RecoveryError::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn fallback(message: impl Into<String>) -> Self {
        RecoveryError::Fallback {
            message: message.into(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for RecoveryError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        RecoveryError::Timeout {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for RecoveryError {
    fn from(err: serde_json::Error) -> Self {
        RecoveryError::Internal {
            message: format!("JSON serialization error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_matches_variant() {
        let open = RecoveryError::CircuitOpen {
            name: "ai_provider_openai".to_string(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert!(open.is_rejection());

        let provider = RecoveryError::Provider {
            provider: "openai".to_string(),
            message: "overloaded".to_string(),
            status_code: Some(529),
        };
        assert_eq!(provider.kind(), ErrorKind::Provider);
        assert!(!provider.is_rejection());
    }

    #[test]
    fn test_retry_after() {
        let rate_limit = RecoveryError::RateLimit {
            message: "Too many requests".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(rate_limit.retry_after(), Some(Duration::from_secs(30)));

        let connection = RecoveryError::Connection {
            message: "refused".to_string(),
        };
        assert_eq!(connection.retry_after(), None);
    }

    #[test]
    fn test_display_keeps_message() {
        let err = RecoveryError::Validation {
            message: "X".to_string(),
        };
        assert_eq!(err.to_string(), "Validation error: X");
        assert_eq!(ErrorKind::RateLimit.to_string(), "rate_limit");
    }

    #[test]
    fn test_error_class() {
        let class = ErrorClass::Retryable(ErrorKind::Timeout);
        assert!(class.is_retryable());
        assert_eq!(class.kind(), ErrorKind::Timeout);
        assert!(!ErrorClass::Fatal(ErrorKind::Validation).is_retryable());
    }
}
