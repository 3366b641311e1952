//! Error types for the SealDB engine.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in SealDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] sealdb_storage::StorageError),

    /// Document codec error.
    #[error("codec error: {0}")]
    Codec(#[from] sealdb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Authentication failed or a frame is malformed.
    ///
    /// Fatal for the record being read, never for the process.
    #[error("tampered or corrupted data: {context}")]
    TamperOrCorruption {
        /// What was being decoded.
        context: String,
    },

    /// A unique index would hold two documents with the same value.
    #[error("unique constraint on {group}.{field} violated")]
    ConstraintViolation {
        /// The group holding the index.
        group: String,
        /// The indexed field path.
        field: String,
    },

    /// The write-ahead log could not be made durable.
    #[error("WAL write failed: {message}")]
    WalWrite {
        /// Description of the failure.
        message: String,
    },

    /// The WAL header is unreadable or belongs to another database.
    #[error("unreadable WAL header: {message}")]
    WalHeader {
        /// Description of the problem.
        message: String,
    },

    /// Another handle holds the database lock.
    #[error("database at {} is locked by another owner", path.display())]
    LockBusy {
        /// Path of the lock file.
        path: PathBuf,
    },

    /// A lookup found nothing.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The transaction is no longer open.
    #[error("transaction is {state}, no further operations allowed")]
    TransactionNotActive {
        /// The state the transaction is in.
        state: &'static str,
    },

    /// The document cannot be stored as given.
    #[error("invalid document: {message}")]
    InvalidDocument {
        /// Description of the problem.
        message: String,
    },

    /// Group names must be non-empty and free of path separators.
    #[error("invalid group name {name:?}")]
    InvalidGroupName {
        /// The rejected name.
        name: String,
    },

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Deriving keys from the passphrase failed.
    #[error("key derivation failed: {message}")]
    KeyDerivation {
        /// Description of the failure.
        message: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl CoreError {
    /// Creates a tamper/corruption error.
    pub fn tamper(context: impl Into<String>) -> Self {
        Self::TamperOrCorruption {
            context: context.into(),
        }
    }

    /// Creates a constraint violation error.
    pub fn constraint(group: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            group: group.into(),
            field: field.into(),
        }
    }

    /// Creates a WAL write error.
    pub fn wal_write(message: impl Into<String>) -> Self {
        Self::WalWrite {
            message: message.into(),
        }
    }

    /// Creates a WAL header error.
    pub fn wal_header(message: impl Into<String>) -> Self {
        Self::WalHeader {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an invalid document error.
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
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

    /// Creates a key derivation error.
    pub fn key_derivation(message: impl Into<String>) -> Self {
        Self::KeyDerivation {
            message: message.into(),
        }
    }

    /// Returns `true` for [`CoreError::TamperOrCorruption`].
    #[must_use]
    pub fn is_tamper(&self) -> bool {
        matches!(self, Self::TamperOrCorruption { .. })
    }

    /// Returns `true` for [`CoreError::ConstraintViolation`].
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }

    /// Returns `true` for [`CoreError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
