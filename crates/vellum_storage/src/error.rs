//! Storage error types.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by backends, volumes and fault hooks.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An operating-system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes past the end of the store.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Size of the store at the time of the read.
        size: u64,
    },

    /// Truncation to a size larger than the store.
    #[error("cannot truncate to {requested} bytes, store holds {size}")]
    InvalidTruncate {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },

    /// A named file or directory does not exist in the volume.
    #[error("not found: {name}")]
    NotFound {
        /// Volume-relative name.
        name: String,
    },

    /// A named file or directory already exists in the volume.
    #[error("already exists: {name}")]
    AlreadyExists {
        /// Volume-relative name.
        name: String,
    },

    /// A fault was injected at a named point.
    #[error("injected fault at {point}")]
    FaultInjected {
        /// The fail point that fired.
        point: String,
    },
}

impl StorageError {
    /// Creates a not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates an injected-fault error.
    pub fn fault(point: impl Into<String>) -> Self {
        Self::FaultInjected {
            point: point.into(),
        }
    }

    /// Returns true if this error came from a fail point rather than the OS.
    #[must_use]
    pub fn is_injected(&self) -> bool {
        matches!(self, Self::FaultInjected { .. })
    }
}
