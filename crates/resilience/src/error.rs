//! Error types for the resilience pipeline
//!
//! Two layers of errors exist:
//! - [`OperationError`] - what a protected operation returns, carrying an explicit
//!   [`FailureKind`] that decides retryability
//! - [`ResilienceError`] - what the policies return to callers, one variant per
//!   remediation (retry later, fix the caller, wait for recovery, stop using the instance)

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of an operation failure
///
/// The non-retryable kinds are contract or programming violations: repeating the
/// call cannot change the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The caller passed an argument the dependency rejects
    InvalidArgument,
    /// The operation is not valid in the current state
    InvalidState,
    /// The caller is not allowed to perform the operation
    Unauthorized,
    /// Anything else - timeouts, connection resets, 5xx responses
    Transient,
}

impl FailureKind {
    /// Whether a failure of this kind may succeed on a later attempt
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid_argument"),
            Self::InvalidState => write!(f, "invalid_state"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

/// Error returned by a protected operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    /// Error message
    pub message: String,

    /// Failure classification
    pub kind: FailureKind,

    /// Error type/code for programmatic handling (e.g. an HTTP status or API code)
    pub error_type: Option<String>,
}

impl OperationError {
    /// Create an error with an explicit kind
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            error_type: None,
        }
    }

    /// Create a transient (retryable) error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidArgument, message)
    }

    /// Create an invalid-state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidState, message)
    }

    /// Create an unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unauthorized, message)
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Whether the retry executor may attempt the operation again
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{} ({})", self.message, error_type),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for OperationError {}

impl From<anyhow::Error> for OperationError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{:#}", err))
    }
}

/// Coarse error classification exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Contract violation; fix the caller
    NonRetryable,
    /// The operation kept failing after all retries; back off and try later
    Transient,
    /// The breaker rejected the call; wait for recovery
    CircuitOpen,
    /// The policy was torn down; stop using it
    Disposed,
    /// The caller cancelled the call
    Cancelled,
}

/// Errors returned by the resilience policies and the pipeline
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResilienceError {
    /// The operation failed with a non-retryable kind
    #[error("non-retryable failure on attempt {attempts}: {source}")]
    NonRetryable {
        /// Attempts made, including the failing one
        attempts: u32,
        source: OperationError,
    },

    /// Every attempt failed with a transient error
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// The failure of the final attempt
        source: OperationError,
    },

    /// The circuit breaker rejected the call without invoking the operation
    #[error("circuit breaker is open, next attempt allowed at {next_attempt_at} (in {retry_after:?})")]
    CircuitOpen {
        /// Earliest wall-clock time a call may be admitted again. While a
        /// half-open trial is running this is a short hint, not a guarantee.
        next_attempt_at: DateTime<Utc>,
        /// Time remaining until `next_attempt_at`
        retry_after: Duration,
    },

    /// The component was disposed before or during the call
    #[error("{component} has been disposed")]
    Disposed { component: &'static str },

    /// The cancellation token fired before the call completed
    #[error("operation cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl ResilienceError {
    /// Classify this error for caller remediation
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NonRetryable { .. } => ErrorKind::NonRetryable,
            Self::RetriesExhausted { .. } => ErrorKind::Transient,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Disposed { .. } => ErrorKind::Disposed,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// The operation error behind this failure, if the operation ran at all
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            Self::NonRetryable { source, .. } | Self::RetriesExhausted { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }

    /// Number of operation invocations made before this error was produced
    pub fn attempts(&self) -> u32 {
        match self {
            Self::NonRetryable { attempts, .. }
            | Self::RetriesExhausted { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
            Self::CircuitOpen { .. } | Self::Disposed { .. } => 0,
        }
    }

    /// Whether this error reflects a failure of the protected dependency
    ///
    /// Only these outcomes count against the circuit breaker; rejections and
    /// cancellations say nothing about the dependency's health.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            Self::NonRetryable { .. } | Self::RetriesExhausted { .. }
        )
    }

    /// Check if this error is a circuit-open rejection
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error indicates cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A configuration field violates its constraint
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// An environment variable could not be parsed
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_retryability() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::InvalidArgument.is_retryable());
        assert!(!FailureKind::InvalidState.is_retryable());
        assert!(!FailureKind::Unauthorized.is_retryable());
    }

    #[test]
    fn test_operation_error_display() {
        let err = OperationError::transient("connection reset").with_type("ECONNRESET");
        assert_eq!(err.to_string(), "connection reset (ECONNRESET)");
        assert!(err.is_retryable());

        let err = OperationError::unauthorized("bad api key");
        assert_eq!(err.to_string(), "bad api key");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_anyhow_is_transient() {
        let err: OperationError = anyhow::anyhow!("socket closed")
            .context("fetching ticker")
            .into();
        assert_eq!(err.kind, FailureKind::Transient);
        assert!(err.message.contains("fetching ticker"));
        assert!(err.message.contains("socket closed"));
    }

    #[test]
    fn test_error_kinds() {
        let exhausted = ResilienceError::RetriesExhausted {
            attempts: 3,
            source: OperationError::transient("timeout"),
        };
        assert_eq!(exhausted.kind(), ErrorKind::Transient);
        assert_eq!(exhausted.attempts(), 3);
        assert!(exhausted.is_dependency_failure());
        assert!(exhausted.to_string().contains("3 attempts"));

        let open = ResilienceError::CircuitOpen {
            next_attempt_at: Utc::now(),
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert!(open.is_circuit_open());
        assert!(!open.is_dependency_failure());
        assert!(open.operation_error().is_none());

        let disposed = ResilienceError::Disposed {
            component: "bulkhead",
        };
        assert_eq!(disposed.kind(), ErrorKind::Disposed);
        assert_eq!(disposed.to_string(), "bulkhead has been disposed");

        let cancelled = ResilienceError::Cancelled { attempts: 1 };
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_dependency_failure());
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let err = ResilienceError::NonRetryable {
            attempts: 1,
            source: OperationError::invalid_argument("quantity must be positive"),
        };
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("quantity must be positive"));
    }
}
