//! Secondary indexes.
//!
//! Each group owns an [`IndexManager`] holding one [`HashIndex`] per indexed
//! field. Indexes live in memory only: their definitions are persisted as
//! catalog blocks and their contents are rebuilt from the record store when
//! the database opens.

mod hash;
mod manager;

pub use hash::{index_key, value_key, HashIndex};
pub use manager::{intersect, IndexInfo, IndexManager};
