//! # SealDB Testkit
//!
//! Test utilities for SealDB.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - A crash harness that kills, damages and reopens on-disk databases
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sealdb_testkit::prelude::*;
//!
//! #[test]
//! fn survives_reopen() {
//!     let harness = CrashHarness::new();
//!     let db = harness.open();
//!     db.group("users").unwrap().insert(doc! { "name" => "Alice" }).unwrap();
//!     harness.crash(db);
//!     assert_eq!(harness.open().group("users").unwrap().len().unwrap(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use sealdb_core::{doc, Config, CoreError, Database, Document, DocumentId, Query, Value};
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;

/// Routes engine logs to the test output. Reads `RUST_LOG`, defaulting to
/// `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second call finds the subscriber already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
