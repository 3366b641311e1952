//! Database facade.
//!
//! A [`Database`] owns one directory (or a pair of caller-supplied
//! backends). Everything else, [`Group`] handles and open
//! [`Transaction`]s, shares its engine.

mod engine;
mod recovery;

pub use engine::{CompactionReport, VerifyReport};
pub(crate) use engine::{Engine, Writer};

use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::error::CoreResult;
use crate::group::Group;
use crate::stats::StatsSnapshot;
use crate::transaction::{validate_group_name, Transaction};
use crate::types::SequenceNumber;
use engine::Layout;
use sealdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::path::Path;
use std::sync::Arc;

/// An open SealDB database.
///
/// # Example
///
/// ```ignore
/// let db = Database::open("app.sealdb", b"correct horse")?;
/// let users = db.group("users")?;
/// users.create_index("email", true)?;
/// users.insert(doc! { "name" => "Alice", "email" => "alice@example.com" })?;
/// let alice = users.find_one(Query::new().eq("name", "Alice"))?;
/// db.close()?;
/// ```
pub struct Database {
    engine: Arc<Engine>,
}

impl Database {
    /// Opens the database in directory `path`, creating it if missing.
    ///
    /// # Errors
    ///
    /// - [`crate::CoreError::LockBusy`] if another handle has it open
    /// - [`crate::CoreError::TamperOrCorruption`] for a wrong passphrase
    /// - [`crate::CoreError::WalHeader`] if the WAL belongs elsewhere
    pub fn open(path: impl AsRef<Path>, passphrase: impl AsRef<[u8]>) -> CoreResult<Self> {
        Self::open_with_config(path, passphrase, Config::default())
    }

    /// Opens the database in directory `path` with custom configuration.
    ///
    /// # Errors
    ///
    /// See [`Database::open`]. Also returns [`crate::CoreError::NotFound`]
    /// if the database does not exist and `create_if_missing` is off.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        passphrase: impl AsRef<[u8]>,
        config: Config,
    ) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path.as_ref(), config.create_if_missing)?;
        dir.remove_stale_compaction()?;
        let data = Box::new(FileBackend::open(&dir.data_path())?);
        let wal = Box::new(FileBackend::open(&dir.wal_path())?);
        Self::from_parts(config, passphrase.as_ref(), Layout::Directory(dir), data, wal)
    }

    /// Opens a fresh database that lives in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation fails.
    pub fn open_in_memory(passphrase: impl AsRef<[u8]>, config: Config) -> CoreResult<Self> {
        Self::from_parts(
            config,
            passphrase.as_ref(),
            Layout::Memory,
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
        )
    }

    /// Opens a database on caller-supplied backends. No lock is taken and
    /// [`Database::compact`] is unavailable.
    ///
    /// # Errors
    ///
    /// See [`Database::open`].
    pub fn open_with_backends(
        config: Config,
        passphrase: impl AsRef<[u8]>,
        data: Box<dyn StorageBackend>,
        wal: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        Self::from_parts(config, passphrase.as_ref(), Layout::Custom, data, wal)
    }

    fn from_parts(
        config: Config,
        passphrase: &[u8],
        layout: Layout,
        data: Box<dyn StorageBackend>,
        wal: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let engine = recovery::open_engine(config, passphrase, layout, data, wal)?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    /// Returns a handle to group `name`. The group comes into existence
    /// with its first committed write or index.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::InvalidGroupName`] for an empty name or
    /// one containing path or wildcard characters.
    pub fn group(&self, name: &str) -> CoreResult<Group> {
        self.engine.ensure_open()?;
        validate_group_name(name)?;
        Ok(Group::new(Arc::clone(&self.engine), name))
    }

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::DatabaseClosed`] after close.
    pub fn begin(&self) -> CoreResult<Transaction> {
        self.engine.begin()
    }

    /// Runs `f` in a transaction, committing on `Ok` and rolling back on
    /// `Err`.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` or of the commit.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<T>,
    {
        let mut txn = self.begin()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Moves everything committed into the data file and empties the WAL.
    ///
    /// # Errors
    ///
    /// Returns an error if syncing or truncating fails.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.engine.checkpoint()
    }

    /// Rewrites the data file keeping only live documents.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::InvalidOperation`] for databases opened
    /// with [`Database::open_with_backends`], or an I/O error.
    pub fn compact(&self) -> CoreResult<CompactionReport> {
        self.engine.compact()
    }

    /// Checks the integrity of both files without changing them: every
    /// data block and visible document is authenticated and the WAL is
    /// read to its end.
    ///
    /// Damage the engine tolerates, such as a superseded block that no
    /// longer authenticates, shows up here and nowhere else.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::DatabaseClosed`] after close, or an
    /// error if a file cannot be read.
    pub fn verify(&self) -> CoreResult<VerifyReport> {
        self.engine.verify()
    }

    /// Drops a group with its documents and indexes. Returns `false` if it
    /// did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be persisted.
    pub fn drop_group(&self, name: &str) -> CoreResult<bool> {
        self.engine.drop_group(name)
    }

    /// Names of all groups, sorted.
    #[must_use]
    pub fn group_names(&self) -> Vec<String> {
        self.engine.read_snapshot().groups.keys().cloned().collect()
    }

    /// Returns a snapshot of the operation counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats.snapshot()
    }

    /// Sequence number of the latest visible commit.
    #[must_use]
    pub fn committed_seq(&self) -> SequenceNumber {
        self.engine.committed_seq()
    }

    /// Directory of the database, if it has one.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.engine.layout.path()
    }

    /// Returns `true` until the database is closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    /// Checkpoints (if [`Config::checkpoint_on_close`] is set) and releases
    /// the lock. Further operations fail with
    /// [`crate::CoreError::DatabaseClosed`]. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint fails; the lock is
    /// released anyway.
    pub fn close(&self) -> CoreResult<()> {
        self.engine.close(self.engine.config.checkpoint_on_close)
    }

    /// Abandons the database as if the process had died: no checkpoint,
    /// nothing flushed beyond what commits already made durable.
    #[doc(hidden)]
    pub fn simulate_crash(self) {
        self.engine.crash();
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "error while closing database");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("engine", &self.engine)
            .finish()
    }
}
