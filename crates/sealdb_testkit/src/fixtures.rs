//! Test fixtures and database helpers.
//!
//! Every fixture opens with [`test_config`], which swaps the production
//! Argon2 cost for a cheap one so tests stay fast.

use sealdb_codec::Document;
use sealdb_core::{Config, Database, KdfParams};
use std::path::Path;
use tempfile::TempDir;

/// Passphrase used by every fixture.
pub const TEST_PASSPHRASE: &[u8] = b"correct horse battery staple";

/// Default configuration for tests: low KDF cost, everything else as in
/// production.
#[must_use]
pub fn test_config() -> Config {
    Config::default().kdf(KdfParams::low_cost())
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self {
            db: Database::open_in_memory(TEST_PASSPHRASE, test_config())
                .expect("failed to open in-memory database"),
            temp_dir: None,
        }
    }

    /// Creates a new database in a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let db = Database::open_with_config(temp_dir.path(), TEST_PASSPHRASE, test_config())
            .expect("failed to open file database");
        Self {
            db,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use sealdb_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         let users = db.group("users").unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a database in a temporary directory.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("file database should have a path");
    f(&test_db.db, path)
}

/// Converts a JSON object into a document.
///
/// # Panics
///
/// Panics if `json` is not an object or holds an integer beyond `i64`.
pub fn document_from_json(json: serde_json::Value) -> Document {
    serde_json::from_value(json).expect("JSON fixture must be an object")
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use sealdb_core::DocumentId;

    /// Creates a `users` group holding Alice (30, admin) and Bob (25,
    /// user), with a unique index on `email`. Returns their ids in that
    /// order.
    pub fn users(db: &Database) -> (DocumentId, DocumentId) {
        let users = db.group("users").expect("valid group name");
        users.create_index("email", true).expect("create index");
        let ids = users
            .insert_many([
                document_from_json(serde_json::json!({
                    "name": "Alice", "age": 30, "role": "admin", "email": "alice@example.com"
                })),
                document_from_json(serde_json::json!({
                    "name": "Bob", "age": 25, "role": "user", "email": "bob@example.com"
                })),
            ])
            .expect("insert users");
        (ids[0], ids[1])
    }

    /// Inserts `count` documents `{ "n": i, "bucket": i % 10 }` into
    /// `group` in a single transaction.
    pub fn numbered(db: &Database, group: &str, count: usize) -> Vec<DocumentId> {
        db.transaction(|txn| {
            (0..count)
                .map(|i| {
                    let n = i64::try_from(i).unwrap_or(i64::MAX);
                    let mut doc = Document::new();
                    doc.insert("n", n);
                    doc.insert("bucket", n % 10);
                    txn.insert(group, doc)
                })
                .collect()
        })
        .expect("insert numbered documents")
    }
}
