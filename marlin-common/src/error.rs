//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `marlin`.
pub type MarlinResult<T> = Result<T, MarlinError>;

/// Error taxonomy shared by the command layer, the storage engine, and replication.
///
/// `CommitRetry` is the only recoverable post-write error class: optimistic commit loops
/// consume it up to their retry bound and every other variant short-circuits. `NotFound`
/// and `Expired` are consumed by read paths and mapped to command-specific empty replies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarlinError {
    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Record exists but its TTL has elapsed.
    #[error("expired")]
    Expired,

    /// Malformed command payload.
    #[error("{0}")]
    ParsePkt(String),

    /// Command option carries an invalid value.
    #[error("{0}")]
    ParseOpt(String),

    /// Stored bytes are not parseable as the required type.
    #[error("{0}")]
    Decode(String),

    /// Arithmetic result does not fit the target integer type.
    #[error("{0}")]
    Overflow(String),

    /// Compare-and-swap version mismatch.
    #[error("{0}")]
    Cas(String),

    /// Optimistic write-write conflict detected at commit time.
    #[error("commit conflict")]
    CommitRetry,

    /// Socket-level failure or timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Unreachable code path or unsupported operation.
    #[error("{0}")]
    Internal(String),
}

impl MarlinError {
    /// Returns whether the error is the retryable commit-conflict class.
    #[must_use]
    pub fn is_commit_retry(&self) -> bool {
        matches!(self, Self::CommitRetry)
    }
}

impl From<std::io::Error> for MarlinError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}
