//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended in the middle of an item.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Indefinite-length items are not part of the format.
    #[error("indefinite-length items are forbidden")]
    IndefiniteLengthForbidden,

    /// Invalid UTF-8 in a text item.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Structurally invalid input.
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// A construct outside the supported value model.
    #[error("unsupported item: {type_name}")]
    UnsupportedType {
        /// Name of the unsupported item.
        type_name: String,
    },

    /// A length prefix exceeds the hard decoding limits.
    #[error("declared size {claimed} exceeds limit {max_allowed}")]
    SizeLimitExceeded {
        /// Size claimed by the input.
        claimed: u64,
        /// Maximum accepted size.
        max_allowed: u64,
    },

    /// A mapping repeats a key.
    #[error("duplicate map key {key:?}")]
    DuplicateKey {
        /// The repeated key.
        key: String,
    },

    /// Input left over after the top-level item.
    #[error("{count} trailing bytes after value")]
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },

    /// Nesting deeper than the decoder accepts.
    #[error("nesting deeper than {max_depth} levels")]
    TooDeep {
        /// Maximum accepted depth.
        max_depth: usize,
    },
}

impl CodecError {
    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Create an unsupported type error.
    pub fn unsupported_type(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }
}
