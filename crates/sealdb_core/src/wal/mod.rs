//! Write-ahead log for durability and crash recovery.
//!
//! Every committed transaction reaches the WAL before its caller is told it
//! committed. On open, committed transactions newer than the last
//! checkpoint are replayed into the record store.
//!
//! ## File Format
//!
//! ```text
//! header: | magic "SWAL" (4) | version (2) | reserved (2) | salt (16) | crc32 (4) |
//! entry:  | length (4) | crc32 of frame (4) | sealed frame (length) |
//! ```
//!
//! The salt ties the log to its data file. Each frame is a sealed
//! [`WalRecord`] and is authenticated with the WAL subkey.
//!
//! ## Recovery Policy
//!
//! A damaged header is fatal. A short entry, a checksum mismatch or an
//! authentication failure in the entry stream is treated as the end of the
//! log: the crash happened while that entry was being written, so it and
//! everything after it never committed.

mod log;
mod record;

pub use log::{CommittedTransaction, Replay, WriteAheadLog, WAL_HEADER_SIZE, WAL_MAGIC, WAL_VERSION};
pub use record::{compute_crc32, WalRecord, WalRecordType};
