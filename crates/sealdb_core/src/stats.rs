//! Database statistics.
//!
//! ```rust,ignore
//! let stats = db.stats();
//! println!("commit batches: {}", stats.commit_batches);
//! println!("transactions: {}", stats.transactions_committed);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Database counters.
///
/// All counters are atomic and can be read while operations are in
/// progress. Values only ever increase.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    /// Documents fetched from the record store.
    reads: AtomicU64,
    /// Document versions written (inserts and updates).
    documents_written: AtomicU64,
    /// Documents deleted.
    documents_deleted: AtomicU64,
    /// Queries answered by a full group scan.
    scans: AtomicU64,
    /// Index lookups performed by queries.
    index_lookups: AtomicU64,

    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,

    /// Physical WAL flushes, each covering one or more transactions.
    commit_batches: AtomicU64,
    checkpoints: AtomicU64,
    /// Records that failed authentication or decoding.
    corrupt_records: AtomicU64,
}

impl DatabaseStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.documents_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.documents_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_index_lookup(&self) {
        self.index_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_batch(&self) {
        self.commit_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_corrupt(&self) {
        self.corrupt_records.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            reads: load(&self.reads),
            documents_written: load(&self.documents_written),
            documents_deleted: load(&self.documents_deleted),
            scans: load(&self.scans),
            index_lookups: load(&self.index_lookups),
            transactions_started: load(&self.transactions_started),
            transactions_committed: load(&self.transactions_committed),
            transactions_aborted: load(&self.transactions_aborted),
            commit_batches: load(&self.commit_batches),
            checkpoints: load(&self.checkpoints),
            corrupt_records: load(&self.corrupt_records),
        }
    }
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Documents fetched from the record store.
    pub reads: u64,
    /// Document versions written.
    pub documents_written: u64,
    /// Documents deleted.
    pub documents_deleted: u64,
    /// Queries answered by a full group scan.
    pub scans: u64,
    /// Index lookups performed by queries.
    pub index_lookups: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted or rolled back.
    pub transactions_aborted: u64,
    /// Physical WAL flushes.
    pub commit_batches: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
    /// Records that failed authentication or decoding.
    pub corrupt_records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(DatabaseStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn counters_show_up_in_snapshot() {
        let stats = DatabaseStats::new();
        stats.record_read();
        stats.record_read();
        stats.record_write();
        stats.record_scan();
        stats.record_commit_batch();
        stats.record_corrupt();

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 2);
        assert_eq!(snap.documents_written, 1);
        assert_eq!(snap.scans, 1);
        assert_eq!(snap.commit_batches, 1);
        assert_eq!(snap.corrupt_records, 1);
        assert_eq!(snap.checkpoints, 0);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(DatabaseStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_transaction_start();
                        s.record_transaction_commit();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 800);
        assert_eq!(snap.transactions_committed, 800);
    }
}
