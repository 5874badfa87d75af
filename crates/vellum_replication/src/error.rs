//! Error types for replication.

use thiserror::Error;
use vellum_core::CoreError;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur while replicating a collection.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A single exchange with the leader failed.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the exchange can be retried.
        retryable: bool,
    },

    /// The leader did not answer in time.
    #[error("request to leader timed out")]
    Timeout,

    /// The leader stayed unreachable for every retry.
    #[error("leader unreachable after {attempts} attempts: {last_error}")]
    LeaderUnreachable {
        /// Attempts made.
        attempts: u32,
        /// The last failure seen.
        last_error: String,
    },

    /// Leader and follower hold the same key and revision with different
    /// bodies.
    #[error("conflict on key '{key}' at revision {rev}: bodies differ")]
    Conflict {
        /// Document key.
        key: String,
        /// The shared revision.
        rev: u64,
    },

    /// The leader does not support the request.
    #[error("leader does not implement {request}")]
    NotImplemented {
        /// Name of the request.
        request: String,
    },

    /// The leader answered with an error.
    #[error("leader error {status}: {message}")]
    Leader {
        /// HTTP-style status.
        status: u16,
        /// Message from the leader.
        message: String,
    },

    /// The leader sent something the follower did not ask for.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local engine error.
    #[error("engine error: {0}")]
    Core(#[from] CoreError),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A sync is already running on this engine.
    #[error("sync already running")]
    Busy,
}

impl ReplicationError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the exchange that produced this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Timeout => true,
            Self::Leader { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if a local apply step failed and a later round may
    /// repair it.
    pub fn is_local_apply_failure(&self) -> bool {
        match self {
            Self::Core(err) => {
                err.is_injected()
                    || matches!(err, CoreError::TransactionAborted { .. })
                    || err.is_io()
            }
            _ => false,
        }
    }
}
