//! Transactions with ACID guarantees.
//!
//! - **Atomicity**: a transaction's changes are logged between a begin
//!   and a commit marker, and replay ignores transactions without one
//! - **Consistency**: unique indexes are checked when a write is staged
//!   and re-checked by the commit leader
//! - **Isolation**: transactions read the snapshot they began with
//! - **Durability**: `commit` returns only after the WAL flush covering
//!   the transaction

mod commit;
mod state;

pub(crate) use commit::CommitRequest;
pub(crate) use state::validate_group_name;
pub use state::{Transaction, TransactionState, CREATED_AT_FIELD, UPDATED_AT_FIELD};
