//! Shared engine state behind [`crate::Database`], [`crate::Group`] and
//! [`crate::Transaction`].

use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::lock::WriteLockGuard;
use crate::snapshot::{GroupState, Snapshot};
use crate::stats::DatabaseStats;
use crate::store::compaction;
use crate::store::RecordStore;
use crate::transaction::{validate_group_name, CommitRequest, Transaction};
use crate::types::{GroupId, SequenceNumber, TransactionId};
use crate::wal::WriteAheadLog;
use parking_lot::{Mutex, RwLock};
use sealdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// State owned by whoever holds the commit section.
#[derive(Debug)]
pub(crate) struct Writer {
    pub wal: WriteAheadLog,
    pub next_group_id: u32,
}

impl Writer {
    fn allocate_group_id(&mut self) -> GroupId {
        let id = GroupId::new(self.next_group_id);
        self.next_group_id += 1;
        id
    }
}

/// Where the database lives.
#[derive(Debug)]
pub(crate) enum Layout {
    Directory(DatabaseDir),
    Memory,
    /// Caller-supplied backends; nothing to lock or rename.
    Custom,
}

impl Layout {
    pub fn write_lock(&self) -> CoreResult<Option<WriteLockGuard<'_>>> {
        match self {
            Self::Directory(dir) => dir.write_lock().map(Some),
            Self::Memory | Self::Custom => Ok(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Directory(dir) => Some(dir.path()),
            Self::Memory | Self::Custom => None,
        }
    }

    fn release(&self) -> CoreResult<()> {
        match self {
            Self::Directory(dir) => dir.release(),
            Self::Memory | Self::Custom => Ok(()),
        }
    }
}

/// Sizes before and after a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Data file size before compaction.
    pub bytes_before: u64,
    /// Data file size after compaction.
    pub bytes_after: u64,
    /// Live documents copied.
    pub documents: usize,
}

/// Result of [`crate::Database::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Data file size.
    pub data_bytes: u64,
    /// Blocks found in the data file, live or superseded.
    pub data_blocks: usize,
    /// Data blocks whose header or body failed verification.
    pub damaged_blocks: usize,
    /// Trailing data file bytes that do not form a block.
    pub unreadable_tail: u64,
    /// Documents visible in the current snapshot.
    pub live_documents: usize,
    /// Visible documents that cannot be read back.
    pub unreadable_documents: usize,
    /// WAL size.
    pub wal_bytes: u64,
    /// Intact WAL entries.
    pub wal_entries: usize,
    /// Highest sequence in the WAL.
    pub wal_last_sequence: SequenceNumber,
    /// Whether the WAL ends in a damaged entry.
    pub wal_torn: bool,
}

impl VerifyReport {
    /// Returns `true` if nothing failed verification.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.damaged_blocks == 0
            && self.unreadable_tail == 0
            && self.unreadable_documents == 0
            && !self.wal_torn
    }
}

pub(crate) struct Engine {
    pub config: Config,
    snapshot: RwLock<Arc<Snapshot>>,
    /// The commit section. Lock order: `writer`, then `snapshot`.
    pub writer: Mutex<Writer>,
    pub queue: Mutex<Vec<CommitRequest>>,
    next_txid: AtomicU64,
    pub stats: Arc<DatabaseStats>,
    pub layout: Layout,
    open: AtomicBool,
    poisoned: AtomicBool,
}

impl Engine {
    pub fn new(
        config: Config,
        snapshot: Snapshot,
        writer: Writer,
        next_txid: u64,
        stats: Arc<DatabaseStats>,
        layout: Layout,
    ) -> Self {
        Self {
            config,
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(writer),
            queue: Mutex::new(Vec::new()),
            next_txid: AtomicU64::new(next_txid),
            stats,
            layout,
            open: AtomicBool::new(true),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn read_snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn publish(&self, snapshot: Snapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }

    pub fn committed_seq(&self) -> SequenceNumber {
        self.snapshot.read().sequence
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    /// Like [`Engine::ensure_open`], and also refuses writes after a commit
    /// could not be applied.
    pub fn check_writable(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CoreError::invalid_operation(
                "an earlier commit could not be applied; reopen the database",
            ));
        }
        Ok(())
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn begin(self: &Arc<Self>) -> CoreResult<Transaction> {
        self.ensure_open()?;
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        self.stats.record_transaction_start();
        Ok(Transaction::new(id, Arc::clone(self), self.read_snapshot()))
    }

    pub fn checkpoint(&self) -> CoreResult<()> {
        let mut writer = self.writer.lock();
        self.check_writable()?;
        self.checkpoint_locked(&mut writer)
    }

    /// Checkpoints the published snapshot. The caller holds the writer.
    pub fn checkpoint_locked(&self, writer: &mut Writer) -> CoreResult<()> {
        let snapshot = self.read_snapshot();
        let _guard = self.layout.write_lock()?;
        write_checkpoint(writer, &snapshot.store, snapshot.sequence)?;
        self.stats.record_checkpoint();
        tracing::info!(seq = %snapshot.sequence, "checkpoint complete");
        Ok(())
    }

    pub fn create_index(&self, group: &str, field: &str, unique: bool) -> CoreResult<()> {
        validate_group_name(group)?;
        if field.is_empty() {
            return Err(CoreError::invalid_operation("index field path is empty"));
        }

        let mut writer = self.writer.lock();
        self.check_writable()?;
        let mut work = Snapshot::clone(&self.read_snapshot());
        let store = Arc::clone(&work.store);
        let sequence = work.sequence;

        let (mut state, created) = match work.group(group) {
            Some(state) => (GroupState::clone(state), false),
            None => (GroupState::new(GroupId::new(writer.next_group_id)), true),
        };

        let mut docs = Vec::with_capacity(state.docs.len());
        for (id, location) in &state.docs {
            docs.push((*id, store.read_document(*location)?));
        }
        let built = state
            .indexes
            .create_index(group, field, unique, docs.iter().map(|(id, doc)| (*id, doc)))?;
        if !built {
            return Ok(());
        }

        if created {
            writer.allocate_group_id();
        }
        let id = state.id;
        work.groups.insert(group.to_string(), Arc::new(state));
        self.commit_catalog(&mut writer, work, |store| {
            if created {
                store.define_group(id, group, sequence)?;
            }
            store.define_index(id, field, unique, sequence)
        })?;
        tracing::info!(group, field, unique, documents = docs.len(), "index created");
        Ok(())
    }

    pub fn drop_index(&self, group: &str, field: &str) -> CoreResult<bool> {
        let mut writer = self.writer.lock();
        self.check_writable()?;
        let mut work = Snapshot::clone(&self.read_snapshot());
        let sequence = work.sequence;
        let Some(state) = work.group_mut(group) else {
            return Ok(false);
        };
        if !state.indexes.drop_index(field) {
            return Ok(false);
        }
        let id = state.id;
        self.commit_catalog(&mut writer, work, |store| store.drop_index(id, field, sequence))?;
        tracing::info!(group, field, "index dropped");
        Ok(true)
    }

    pub fn drop_group(&self, group: &str) -> CoreResult<bool> {
        let mut writer = self.writer.lock();
        self.check_writable()?;
        let mut work = Snapshot::clone(&self.read_snapshot());
        let sequence = work.sequence;
        let Some(state) = work.groups.remove(group) else {
            return Ok(false);
        };
        self.commit_catalog(&mut writer, work, |store| store.drop_group(state.id, sequence))?;
        tracing::info!(group, documents = state.docs.len(), "group dropped");
        Ok(true)
    }

    /// Writes catalog blocks for `work`, checkpoints so they are covered by
    /// the next scan, and publishes `work`.
    fn commit_catalog<F>(&self, writer: &mut Writer, work: Snapshot, write: F) -> CoreResult<()>
    where
        F: FnOnce(&RecordStore) -> CoreResult<()>,
    {
        let result = (|| {
            let _guard = self.layout.write_lock()?;
            write(&work.store)?;
            write_checkpoint(writer, &work.store, work.sequence)
        })();
        if let Err(e) = result {
            // The blocks may be on disk while memory says otherwise.
            self.poison();
            tracing::error!(error = %e, "catalog change failed");
            return Err(e);
        }
        self.stats.record_checkpoint();
        self.publish(work);
        Ok(())
    }

    pub fn compact(&self) -> CoreResult<CompactionReport> {
        let mut writer = self.writer.lock();
        self.check_writable()?;
        let target: Box<dyn StorageBackend> = match &self.layout {
            Layout::Directory(dir) => Box::new(FileBackend::create_truncated(&dir.compact_path())?),
            Layout::Memory => Box::new(InMemoryBackend::new()),
            Layout::Custom => {
                return Err(CoreError::invalid_operation(
                    "compaction needs a directory or in-memory database",
                ))
            }
        };
        self.checkpoint_locked(&mut writer)?;

        let snapshot = self.read_snapshot();
        let _guard = self.layout.write_lock()?;
        let compacted =
            match compaction::compact(&snapshot.store, target, &snapshot.groups, snapshot.sequence) {
                Ok(compacted) => compacted,
                Err(e) => {
                    if let Layout::Directory(dir) = &self.layout {
                        if let Err(cleanup) = dir.remove_stale_compaction() {
                            tracing::warn!(error = %cleanup, "could not remove compaction output");
                        }
                    }
                    return Err(e);
                }
            };
        if let Layout::Directory(dir) = &self.layout {
            dir.install_compacted()?;
        }

        let report = CompactionReport {
            bytes_before: compacted.bytes_before,
            bytes_after: compacted.bytes_after,
            documents: compacted.groups.values().map(|g| g.docs.len()).sum(),
        };
        self.publish(Snapshot {
            sequence: snapshot.sequence,
            store: Arc::new(compacted.store),
            groups: compacted.groups,
        });
        tracing::info!(
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            documents = report.documents,
            "compaction complete"
        );
        Ok(report)
    }

    /// Authenticates every data block, every visible document and every
    /// WAL entry. Commits wait until it finishes.
    pub fn verify(&self) -> CoreResult<VerifyReport> {
        let writer = self.writer.lock();
        self.ensure_open()?;
        let snapshot = self.read_snapshot();

        let audit = snapshot.store.verify()?;
        let mut live_documents = 0;
        let mut unreadable_documents = 0;
        for (name, state) in &snapshot.groups {
            for (id, location) in &state.docs {
                live_documents += 1;
                if let Err(e) = snapshot.store.read_document(*location) {
                    tracing::warn!(group = %name, id = %id, error = %e, "unreadable document");
                    unreadable_documents += 1;
                }
            }
        }
        let wal = writer.wal.replay(SequenceNumber::default())?;

        let report = VerifyReport {
            data_bytes: snapshot.store.size()?,
            data_blocks: audit.blocks,
            damaged_blocks: audit.damaged,
            unreadable_tail: audit.unreadable_tail,
            live_documents,
            unreadable_documents,
            wal_bytes: writer.wal.size(),
            wal_entries: wal.entries,
            wal_last_sequence: wal.last_sequence,
            wal_torn: wal.torn,
        };
        tracing::info!(
            healthy = report.is_healthy(),
            blocks = report.data_blocks,
            damaged = report.damaged_blocks,
            documents = report.live_documents,
            wal_entries = report.wal_entries,
            "verification complete"
        );
        Ok(report)
    }

    /// Stops accepting work, optionally checkpoints, and releases the
    /// process lock. Later calls do nothing.
    pub fn close(&self, checkpoint: bool) -> CoreResult<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut result = Ok(());
        if checkpoint && !self.poisoned.load(Ordering::Acquire) {
            let mut writer = self.writer.lock();
            result = self.checkpoint_locked(&mut writer);
        }
        let released = self.layout.release();
        tracing::info!(path = ?self.layout.path(), "database closed");
        result.and(released)
    }

    /// Stops accepting work without checkpointing, as if the process died.
    pub fn crash(&self) {
        self.open.store(false, Ordering::Release);
        if let Err(e) = self.layout.release() {
            tracing::warn!(error = %e, "could not release lock");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("layout", &self.layout)
            .field("seq", &self.committed_seq())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Makes everything up to `sequence` durable in `store` and empties the
/// log.
pub(crate) fn write_checkpoint(
    writer: &mut Writer,
    store: &RecordStore,
    sequence: SequenceNumber,
) -> CoreResult<()> {
    store.sync()?;
    store.checkpoint(sequence)?;
    store.sync()?;
    writer.wal.truncate(sequence)
}

/// Returns the state of `name`, defining the group in `store` first if it
/// does not exist yet.
pub(crate) fn ensure_group<'a>(
    snapshot: &'a mut Snapshot,
    writer: &mut Writer,
    name: &str,
    sequence: SequenceNumber,
) -> CoreResult<&'a mut GroupState> {
    if snapshot.group(name).is_none() {
        let id = writer.allocate_group_id();
        snapshot.store.define_group(id, name, sequence)?;
        snapshot
            .groups
            .insert(name.to_string(), Arc::new(GroupState::new(id)));
    }
    snapshot
        .group_mut(name)
        .ok_or_else(|| CoreError::invalid_operation(format!("group {name} is missing")))
}
