//! # SealDB Storage
//!
//! Byte-store backends underneath the SealDB data file and write-ahead log.
//!
//! A backend only knows how to read, append, sync and truncate bytes. It
//! never interprets what it stores: block framing, authentication and
//! encryption all live in `sealdb_core`.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - a single OS file, used for `data.sdb` and `wal.log`
//! - [`InMemoryBackend`] - shared, cloneable buffer for ephemeral databases
//!   and crash tests
//! - [`FaultyBackend`] - wraps another backend and fails on demand
//!
//! ## Example
//!
//! ```rust
//! use sealdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"sealed block").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"sealed");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod fault;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use fault::{FaultHandle, FaultyBackend};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
