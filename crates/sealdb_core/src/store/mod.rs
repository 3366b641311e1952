//! Page/record store: the encrypted data file.
//!
//! ## File Format
//!
//! ```text
//! | header | block | block | ... | checkpoint block | block | ...
//! ```
//!
//! Every block carries its own checksum and authentication tag, so damage
//! stays local to the block it hits. The file is append-only between
//! compactions; the latest `Put` or `Tombstone` for a document wins.
//!
//! ## Recovery
//!
//! Blocks up to the last checkpoint are trusted. Blocks after it were
//! written by commits whose WAL entries are still present, so they are cut
//! off at open and rewritten from the WAL replay. This keeps the WAL commit
//! marker the only durability boundary.

mod block;
pub(crate) mod compaction;
mod header;
mod records;

pub use block::{BlockHeader, BlockKind, BlockLocation, BLOCK_HEADER_SIZE, BLOCK_MAGIC};
pub use header::{FileHeader, FileParams, FILE_FORMAT, FILE_MAGIC};
pub use records::{BlockAudit, CatalogGroup, RecordStore, ScanReport};
