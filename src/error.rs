//! Error types for recast
//!
//! This module defines the main error type used throughout recast and the
//! crate-wide [`Result`] alias. Per-transaction failures are reported through
//! these variants and aggregated into run counters; only
//! [`ReplayError::Unrecoverable`] escalates to a full engine shutdown.

use thiserror::Error;

/// Result type alias for recast operations
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Error type for recast operations
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture source error: {0}")]
    Source(String),

    #[error("Corrupt capture frame: {0}")]
    CorruptFrame(String),

    #[error("Unsupported segmented observation on connection {0}")]
    UnsupportedSegment(String),

    #[error("Observation out of order on connection {connection}: write with no prior read")]
    WriteWithoutRequest { connection: String },

    #[error("Connection {0} fell outside the processing window")]
    Expired(String),

    #[error("Touch retries exhausted for connection {0}")]
    TouchRetriesExhausted(String),

    #[error("Target connection error: {0}")]
    Target(String),

    #[error("Malformed target response: {0}")]
    MalformedResponse(String),

    #[error("Target response timed out after {0} ms")]
    ResponseTimeout(u64),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Session was cancelled")]
    SessionCancelled,

    #[error("Replayer is shutting down")]
    ShuttingDown,

    #[error("Output sink error: {0}")]
    Sink(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Unrecoverable error: {0}")]
    Unrecoverable(String),
}

impl ReplayError {
    /// Whether a failed target attempt with this error may be retried.
    ///
    /// Cancellation and shutdown are terminal for the attempt that observed
    /// them; transport-level failures and malformed or late responses are
    /// surfaced to the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplayError::Io(_)
                | ReplayError::Target(_)
                | ReplayError::MalformedResponse(_)
                | ReplayError::ResponseTimeout(_)
        )
    }

    /// Whether this error must escalate to a full engine shutdown.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, ReplayError::Unrecoverable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReplayError::Target("connection refused".into()).is_retryable());
        assert!(ReplayError::ResponseTimeout(3000).is_retryable());
        assert!(!ReplayError::SessionCancelled.is_retryable());
        assert!(!ReplayError::ShuttingDown.is_retryable());
        assert!(!ReplayError::Unrecoverable("boom".into()).is_retryable());
    }

    #[test]
    fn test_unrecoverable_classification() {
        assert!(ReplayError::Unrecoverable("boom".into()).is_unrecoverable());
        assert!(!ReplayError::Target("refused".into()).is_unrecoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ReplayError::RetriesExhausted {
            attempts: 3,
            last_error: "connection reset".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("connection reset"));
    }
}
