//! Error types for recording, slice and sync operations.
//!
//! [`Error`] is the error returned by every fallible storage operation.
//! [`TransferError`] is kept apart because transfer faults are retried and
//! then reported as a failed outcome rather than raised (see [`crate::sync`]).
//!
//! Negative outcomes that are part of normal operation, such as a window that
//! overlaps no samples or a compression request that conflicts with an
//! earlier one, are not errors. They are returned as outcome enums by the
//! operation that produced them.

use thiserror::Error;

/// Convenience type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for storage, segmentation and persistence operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The on-disk sample count disagrees with the expected write pointer.
    ///
    /// On the producing side this marks the whole recording inconsistent and
    /// blocks further flushes until it is resolved by hand.
    #[error("consistency fault in {context}: expected {expected} samples, found {found}")]
    Consistency {
        context: String,
        expected: usize,
        found: usize,
    },

    /// A flush or append was attempted after a consistency fault.
    #[error("{0} is marked inconsistent, writes are blocked")]
    Inconsistent(String),

    /// Invalid start/end for a manual window.
    #[error("invalid time range: {0}")]
    TimeRange(String),

    /// The caller passed an argument the operation cannot accept.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The quantity is not present in the quantity registry.
    #[error("unknown quantity '{0}'")]
    UnknownQuantity(String),

    /// Samples were appended before a start time was set.
    #[error("recording has no start time")]
    NotStarted,

    /// The recording was closed and accepts no more samples.
    #[error("recording {0} is closed")]
    Closed(String),

    /// The persisting guard stayed held through every wait attempt.
    #[error("recording {0} is busy persisting metadata")]
    Busy(String),

    /// The repository has no record for the identity.
    #[error("record '{0}' not found")]
    NotFound(String),

    /// Malformed encoded data.
    #[error("codec error: {0}")]
    Codec(String),

    /// A transfer that has no useful result without the data (pulls).
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for the consistency fault, the only fatal error class.
    pub fn is_consistency(&self) -> bool {
        matches!(self, Error::Consistency { .. })
    }
}

/// Error raised by a [`crate::sync::Transport`] call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Connection refused, reset, DNS failure and the like.
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The peer answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The peer answered 2xx but the body or headers were unusable.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransferError {
    /// Whether another attempt could succeed.
    ///
    /// Network faults, timeouts, 5xx and 429 are transient. Every other
    /// status means the request itself was refused.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(_) | TransferError::Timeout => true,
            TransferError::Status { status, .. } => *status >= 500 || *status == 429,
            TransferError::Malformed(_) => false,
        }
    }
}
