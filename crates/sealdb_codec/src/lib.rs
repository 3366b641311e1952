//! # SealDB Codec
//!
//! The document data model and its binary encoding.
//!
//! Documents are schema-less, insertion-ordered maps of [`Value`]s. The
//! encoding is a strict, deterministic CBOR subset:
//!
//! - integers use the shortest head
//! - floats are always 64-bit
//! - maps have text keys, keep insertion order and never repeat a key
//! - no tags, no indefinite lengths, no trailing bytes
//!
//! ## Usage
//!
//! ```
//! use sealdb_codec::{decode_document, doc, encode_document};
//!
//! let user = doc! { "name" => "Alice", "role" => "admin" };
//! let bytes = encode_document(&user);
//! assert_eq!(decode_document(&bytes).unwrap(), user);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod document;
mod encoder;
mod error;
mod serde_impl;
mod value;

pub use decoder::{decode_document, from_bytes, Decoder, MAX_DEPTH};
pub use document::Document;
pub use encoder::{encode_document, to_bytes, Encoder};
pub use error::{CodecError, CodecResult};
pub use value::Value;
