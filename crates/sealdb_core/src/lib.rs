//! # SealDB Core
//!
//! Storage engine of SealDB, an embedded document store that encrypts and
//! compresses every byte it writes.
//!
//! This crate provides:
//! - the codec pipeline (serialize, zstd, AES-256-GCM)
//! - an append-only, block-authenticated record store
//! - a write-ahead log with group commit and crash replay
//! - transactions with snapshot reads and unique-index checks
//! - hash indexes and a query executor that intersects them
//! - the process lock that keeps a database single-owner
//!
//! ```ignore
//! use sealdb_core::{doc, Database, Query};
//!
//! let db = Database::open("data/app", b"passphrase")?;
//! let users = db.group("users")?;
//! users.create_index("email", true)?;
//! users.insert(doc! { "name" => "Alice", "email" => "alice@example.com" })?;
//!
//! let mut txn = db.begin()?;
//! txn.insert("users", doc! { "name" => "Bob" })?;
//! txn.commit()?;
//!
//! for user in users.find(Query::new().exists("email", true))? {
//!     println!("{:?}", user?);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
pub mod crypto;
mod database;
mod dir;
mod error;
mod group;
mod id;
pub mod index;
mod lock;
mod pipeline;
pub mod query;
pub(crate) mod snapshot;
mod stats;
pub mod store;
mod transaction;
mod types;
pub mod wal;

pub use config::{Config, KdfParams};
pub use database::{CompactionReport, Database, VerifyReport};
pub use dir::{DatabaseDir, DATA_FILE, WAL_FILE};
pub use error::{CoreError, CoreResult};
pub use group::Group;
pub use id::{DocumentId, ID_FIELD};
pub use index::IndexInfo;
pub use lock::{LockToken, ProcessLock, WriteLock, WriteLockGuard, LOCK_FILE, WRITE_LOCK_FILE};
pub use pipeline::{Keyring, Pipeline, FORMAT_VERSION};
pub use query::{Clause, Condition, Cursor, Query};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use transaction::{Transaction, TransactionState, CREATED_AT_FIELD, UPDATED_AT_FIELD};
pub use types::{GroupId, SequenceNumber, TransactionId};

pub use sealdb_codec::{doc, Document, Value};
