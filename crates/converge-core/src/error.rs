//! Error types for converge

use std::time::Duration;
use thiserror::Error;

use crate::types::{AsyncHandle, FieldDiff};

/// Main error type for reconciliation
#[derive(Error, Debug)]
pub enum Error {
    /// The resource does not exist remotely. A valid state during the
    /// initial fetch, not a failure.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote API rejected a stale concurrency token
    #[error("Conflict: {message} (token: {token:?})")]
    Conflict {
        message: String,
        token: Option<String>,
    },

    /// Network or rate-limit failure the transport gave up on
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Timed out after {elapsed:?} waiting for operation {handle}")]
    Timeout {
        handle: AsyncHandle,
        elapsed: Duration,
    },

    #[error("Cancelled{}", .handle.as_ref().map(|h| format!(" while waiting for operation {}", h)).unwrap_or_default())]
    Cancelled { handle: Option<AsyncHandle> },

    /// Caller contract violation, never retried
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// The remote job finished in a failed state
    #[error("Operation {handle} failed: {message}")]
    OperationFailed {
        handle: AsyncHandle,
        message: String,
    },

    #[error("Resource {0} still exists after delete")]
    NotDeleted(String),

    #[error("Apply infeasible: {0}")]
    ApplyInfeasible(String),

    #[error("Differences remain after apply: {}", render_diffs(.0))]
    DiffAfterApply(Vec<FieldDiff>),

    /// Failure during a reconciliation pass, naming the operation that was
    /// in flight and the differences it was resolving
    #[error("Reconciliation failed during {operation} ({} pending difference(s)): {source}", .diffs.len())]
    Reconcile {
        operation: String,
        diffs: Vec<FieldDiff>,
        #[source]
        source: Box<Error>,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

fn render_diffs(diffs: &[FieldDiff]) -> String {
    diffs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>, token: Option<String>) -> Self {
        Error::Conflict {
            message: msg.into(),
            token,
        }
    }

    /// Create an invalid input (programming) error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create an invalid schema error
    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        Error::InvalidSchema(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Wrap an error with the operation that was in flight
    pub fn during(self, operation: impl Into<String>, diffs: Vec<FieldDiff>) -> Self {
        Error::Reconcile {
            operation: operation.into(),
            diffs,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through `Reconcile` wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Reconcile { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled { .. })
    }

    /// Whether a transport may retry the call that produced this error.
    /// The engine itself never retries on this basis.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), Error::Transient(_))
    }

    /// Operation that was in flight when the reconciliation failed
    pub fn operation(&self) -> Option<&str> {
        match self {
            Error::Reconcile { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationSelector;
    use serde_json::json;

    #[test]
    fn test_reconcile_wrapper_reports_operation() {
        let diff = FieldDiff {
            path: "targetSize".into(),
            before: json!(1),
            after: json!(3),
            selector: OperationSelector::triggers("patch"),
            output_only: false,
        };
        let err = Error::conflict("fingerprint mismatch", Some("abc".into()))
            .during("patch", vec![diff]);

        assert_eq!(err.operation(), Some("patch"));
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("during patch"));
        assert!(msg.contains("1 pending difference"));
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(Error::Cancelled { handle: None }.to_string(), "Cancelled");
        let err = Error::Cancelled {
            handle: Some(AsyncHandle {
                id: "op-1".into(),
                status_url: "operations/op-1".into(),
            }),
        };
        assert_eq!(
            err.to_string(),
            "Cancelled while waiting for operation op-1 (operations/op-1)"
        );
    }

    #[test]
    fn test_not_found_through_wrapper() {
        let err = Error::not_found("web").during("recreate", vec![]);
        assert!(err.is_not_found());
        assert!(matches!(err.root(), Error::NotFound(_)));
    }
}
