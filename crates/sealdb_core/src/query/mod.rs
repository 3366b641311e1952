//! Query executor.
//!
//! A [`Query`] is a conjunction of clauses on dotted field paths. Execution:
//!
//! 1. equality clauses on indexed fields become candidate id sets, which
//!    are intersected smallest-first;
//! 2. with no usable index the whole group is the candidate set;
//! 3. candidates are fetched and decoded lazily by the [`Cursor`];
//! 4. the remaining clauses filter each decoded document.
//!
//! Result order is unspecified.

mod cursor;
mod predicate;

pub use cursor::Cursor;
pub use predicate::{Clause, Condition, Query};
