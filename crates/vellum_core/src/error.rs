//! Error types for the Vellum engine.

use crate::types::Revision;
use std::io;
use thiserror::Error;
use vellum_storage::StorageError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend or volume error, including injected faults.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The write-ahead log is corrupted.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A collection datafile is corrupted.
    #[error("datafile corruption: {message}")]
    DatafileCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A checksum did not match its data.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A live object of this kind already uses the name.
    #[error("duplicate name: {kind} '{name}' already exists")]
    DuplicateName {
        /// Object kind, such as "database" or "collection".
        kind: &'static str,
        /// The conflicting name.
        name: String,
    },

    /// A configured limit would be exceeded.
    #[error("resource limit exceeded: {resource} (limit {limit})")]
    ResourceLimit {
        /// What ran out.
        resource: &'static str,
        /// The configured limit.
        limit: u64,
    },

    /// Input failed validation.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// The transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for the abort.
        reason: String,
    },

    /// No document with this key exists.
    #[error("document not found: {collection}/{key}")]
    DocumentNotFound {
        /// Collection name.
        collection: String,
        /// Document key.
        key: String,
    },

    /// A unique constraint (primary key or unique index) was violated.
    #[error("unique constraint violated in {collection}: {detail}")]
    UniqueConstraintViolated {
        /// Collection name.
        collection: String,
        /// The key or index that conflicted.
        detail: String,
    },

    /// A revision precondition failed.
    #[error("revision conflict on {key}: expected {expected}, found {actual}")]
    RevisionConflict {
        /// Document key.
        key: String,
        /// Revision the caller expected.
        expected: Revision,
        /// Revision actually stored.
        actual: Revision,
    },

    /// No live collection with this name exists.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Collection name.
        name: String,
    },

    /// No live database with this name exists.
    #[error("database not found: {name}")]
    DatabaseNotFound {
        /// Database name.
        name: String,
    },

    /// No index with this name or id exists.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// Index name or id.
        name: String,
    },

    /// Another process holds the data directory lock.
    #[error("data directory locked: another process has exclusive access")]
    DatabaseLocked,

    /// An on-disk structure has an unexpected format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is not permitted.
        message: String,
    },

    /// An argument is out of range.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument problem.
        message: String,
    },

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a datafile corruption error.
    pub fn datafile_corruption(message: impl Into<String>) -> Self {
        Self::DatafileCorruption {
            message: message.into(),
        }
    }

    /// Creates a duplicate-name error.
    pub fn duplicate_name(kind: &'static str, name: impl Into<String>) -> Self {
        Self::DuplicateName {
            kind,
            name: name.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates a document-not-found error.
    pub fn document_not_found(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self::DocumentNotFound {
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Creates a unique-constraint error.
    pub fn unique_violated(collection: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UniqueConstraintViolated {
            collection: collection.into(),
            detail: detail.into(),
        }
    }

    /// Creates a collection-not-found error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Creates a database-not-found error.
    pub fn database_not_found(name: impl Into<String>) -> Self {
        Self::DatabaseNotFound { name: name.into() }
    }

    /// Creates an index-not-found error.
    pub fn index_not_found(name: impl Into<String>) -> Self {
        Self::IndexNotFound { name: name.into() }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true for disk and journal failures, injected or real.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }

    /// Returns true if the error came from a fail point.
    #[must_use]
    pub fn is_injected(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_injected())
    }

    /// Returns true for corruption that must halt opening or collection.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::WalCorruption { .. }
                | Self::DatafileCorruption { .. }
                | Self::ChecksumMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_storage_fault_counts_as_io() {
        let err = CoreError::from(StorageError::fault("CreateJournalDocumentCollection"));
        assert!(err.is_io());
        assert!(err.is_injected());
        assert!(!err.is_corruption());
    }

    #[test]
    fn corruption_classification() {
        assert!(CoreError::wal_corruption("bad magic").is_corruption());
        assert!(CoreError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(!CoreError::Closed.is_corruption());
    }

    #[test]
    fn display_includes_context() {
        let err = CoreError::duplicate_name("collection", "users");
        assert_eq!(
            err.to_string(),
            "duplicate name: collection 'users' already exists"
        );
        let err = CoreError::ResourceLimit {
            resource: "databases",
            limit: 4,
        };
        assert_eq!(err.to_string(), "resource limit exceeded: databases (limit 4)");
    }
}
