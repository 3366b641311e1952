//! Fault-injecting backend wrapper.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel for "no torn-write limit armed".
const UNLIMITED: u64 = u64::MAX;

#[derive(Debug)]
struct FaultState {
    fail_append: AtomicBool,
    fail_sync: AtomicBool,
    torn_write_budget: AtomicU64,
    syncs: AtomicU64,
}

/// Switchboard controlling a [`FaultyBackend`] from outside the database.
#[derive(Debug, Clone)]
pub struct FaultHandle {
    state: Arc<FaultState>,
}

impl FaultHandle {
    /// Makes every subsequent `append` fail.
    pub fn fail_appends(&self, enabled: bool) {
        self.state.fail_append.store(enabled, Ordering::SeqCst);
    }

    /// Makes every subsequent `sync` fail.
    pub fn fail_syncs(&self, enabled: bool) {
        self.state.fail_sync.store(enabled, Ordering::SeqCst);
    }

    /// Lets only `bytes` more bytes reach the inner backend; the append that
    /// crosses the limit is written partially and then reports an error.
    pub fn tear_after(&self, bytes: u64) {
        self.state.torn_write_budget.store(bytes, Ordering::SeqCst);
    }

    /// Disarms every fault.
    pub fn heal(&self) {
        self.fail_appends(false);
        self.fail_syncs(false);
        self.state.torn_write_budget.store(UNLIMITED, Ordering::SeqCst);
    }

    /// Number of successful syncs observed so far.
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.state.syncs.load(Ordering::SeqCst)
    }
}

/// Wraps another backend and fails operations on request.
///
/// ```rust
/// use sealdb_storage::{FaultyBackend, InMemoryBackend, StorageBackend};
///
/// let (mut backend, faults) = FaultyBackend::new(InMemoryBackend::new());
/// faults.fail_syncs(true);
/// backend.append(b"entry").unwrap();
/// assert!(backend.sync().is_err());
/// ```
#[derive(Debug)]
pub struct FaultyBackend<B> {
    inner: B,
    state: Arc<FaultState>,
}

impl<B: StorageBackend> FaultyBackend<B> {
    /// Wraps `inner` and returns the handle that controls it.
    pub fn new(inner: B) -> (Self, FaultHandle) {
        let state = Arc::new(FaultState {
            fail_append: AtomicBool::new(false),
            fail_sync: AtomicBool::new(false),
            torn_write_budget: AtomicU64::new(UNLIMITED),
            syncs: AtomicU64::new(0),
        });
        let handle = FaultHandle {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, handle)
    }

    /// Returns the wrapped backend.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: StorageBackend> StorageBackend for FaultyBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if self.state.fail_append.load(Ordering::SeqCst) {
            return Err(StorageError::Injected {
                operation: "append",
            });
        }

        let budget = self.state.torn_write_budget.load(Ordering::SeqCst);
        if budget != UNLIMITED {
            let len = data.len() as u64;
            if len > budget {
                // budget < len <= usize::MAX
                let partial = &data[..budget as usize];
                self.inner.append(partial)?;
                self.state.torn_write_budget.store(0, Ordering::SeqCst);
                return Err(StorageError::Injected {
                    operation: "torn append",
                });
            }
            self.state
                .torn_write_budget
                .store(budget - len, Ordering::SeqCst);
        }

        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.state.fail_sync.load(Ordering::SeqCst) {
            return Err(StorageError::Injected { operation: "sync" });
        }
        self.inner.sync()?;
        self.state.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBackend;

    #[test]
    fn passes_through_when_healthy() {
        let memory = InMemoryBackend::new();
        let (mut backend, faults) = FaultyBackend::new(memory.clone());

        backend.append(b"abc").unwrap();
        backend.sync().unwrap();
        assert_eq!(memory.data(), b"abc");
        assert_eq!(faults.sync_count(), 1);
    }

    #[test]
    fn failed_append_writes_nothing() {
        let memory = InMemoryBackend::new();
        let (mut backend, faults) = FaultyBackend::new(memory.clone());

        faults.fail_appends(true);
        assert!(matches!(
            backend.append(b"abc"),
            Err(StorageError::Injected { operation: "append" })
        ));
        assert!(memory.data().is_empty());

        faults.heal();
        backend.append(b"abc").unwrap();
        assert_eq!(memory.data(), b"abc");
    }

    #[test]
    fn torn_write_keeps_prefix_only() {
        let memory = InMemoryBackend::new();
        let (mut backend, faults) = FaultyBackend::new(memory.clone());

        faults.tear_after(5);
        backend.append(b"abc").unwrap();
        assert!(backend.append(b"defgh").is_err());
        assert_eq!(memory.data(), b"abcde");

        assert!(backend.append(b"x").is_err());
        faults.heal();
        backend.append(b"x").unwrap();
        assert_eq!(memory.data(), b"abcdex");
    }

    #[test]
    fn failed_sync_is_not_counted() {
        let (mut backend, faults) = FaultyBackend::new(InMemoryBackend::new());
        faults.fail_syncs(true);
        assert!(backend.sync().is_err());
        assert_eq!(faults.sync_count(), 0);
        assert!(backend.into_inner().data().is_empty());
    }
}
