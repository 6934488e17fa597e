//! Error types shared by feeds, validators and the nemesis driver.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the harness.
///
/// Validator assertions are not errors: they are collected on the validator
/// and reported when a run ends.
#[derive(Debug, Error)]
pub enum Error {
    /// The job backing a feed reported a failure.
    #[error("job {job_id} failed: {message}")]
    Job {
        /// Job that failed.
        job_id: i64,
        /// Error text reported by the job.
        message: String,
    },

    /// A sink payload could not be decoded into a message.
    #[error("decode error: {0}")]
    Decode(String),

    /// Malformed JSON payload.
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A timestamp string could not be parsed.
    #[error("invalid timestamp {input:?}: {reason}")]
    InvalidTimestamp {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A directory sink contained a file that is not a sink file.
    #[error("unexpected file in sink directory: {}", .0.display())]
    UnexpectedFile(PathBuf),

    /// Sink URI scheme that no back-end understands.
    #[error("unsupported sink uri {0:?}")]
    UnsupportedSink(String),

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The feed is paused and has no buffered messages left.
    #[error("feed is paused")]
    Paused,

    /// The feed was closed.
    #[error("feed is closed")]
    Closed,

    /// The producer stream ended.
    #[error("feed ended")]
    FeedEnded,

    /// A transaction must be restarted by the client.
    #[error("restart transaction: {0}")]
    TxnRetry(String),

    /// A database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// IO error while reading sink storage.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid file name pattern.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A run was configured in a way that cannot make progress.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The watched table was truncated.
    #[error("{0:?} was truncated")]
    TableTruncated(String),

    /// A table event policy has no entry for an event kind.
    #[error("policy does not specify how to handle event type {0}")]
    UnhandledTableEvent(crate::table_event::TableEventKind),
}

impl Error {
    /// True for context cancellation, which callers treat as a graceful
    /// shutdown rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True if the operation may succeed when retried from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TxnRetry(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Paused.is_cancelled());
        assert!(Error::TxnRetry("pushed".into()).is_retryable());
        assert!(!Error::Database("boom".into()).is_retryable());
    }

    #[test]
    fn test_job_error_display() {
        let err = Error::Job {
            job_id: 7,
            message: "sink unavailable".into(),
        };
        assert_eq!(err.to_string(), "job 7 failed: sink unavailable");
    }
}
