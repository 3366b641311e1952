//! Advisory file locks.
//!
//! `LOCK` is held exclusively for as long as a database is open, so a second
//! process, or a second handle in this one, fails fast with
//! [`CoreError::LockBusy`]. `WRITE.LOCK` is held around recovery,
//! checkpoints and compaction, the moments the data file is rewritten or
//! truncated, so external tools such as backup scripts can wait for a
//! consistent file.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Name of the process lock file.
pub const LOCK_FILE: &str = "LOCK";

/// Name of the write lock file.
pub const WRITE_LOCK_FILE: &str = "WRITE.LOCK";

/// Proof that the process lock is held. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockToken {
    file: File,
    path: PathBuf,
}

impl LockToken {
    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquires and releases the per-directory process lock.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLock;

impl ProcessLock {
    /// Takes the exclusive lock on `dir/LOCK` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockBusy`] if another handle holds it.
    pub fn acquire_exclusive(dir: &Path) -> CoreResult<LockToken> {
        let path = dir.join(LOCK_FILE);
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(LockToken { file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(CoreError::LockBusy { path })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lock held by `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the unlock call fails. The lock is released
    /// anyway when the token's file handle closes.
    pub fn release(token: LockToken) -> CoreResult<()> {
        token.file.unlock()?;
        Ok(())
    }
}

/// The write lock file of an open database.
#[derive(Debug)]
pub struct WriteLock {
    file: File,
}

impl WriteLock {
    /// Opens (creating if needed) `dir/WRITE.LOCK`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(dir: &Path) -> CoreResult<Self> {
        Ok(Self {
            file: open_lock_file(&dir.join(WRITE_LOCK_FILE))?,
        })
    }

    /// Blocks until the write lock is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock call fails.
    pub fn lock(&self) -> CoreResult<WriteLockGuard<'_>> {
        self.file.lock_exclusive()?;
        Ok(WriteLockGuard { file: &self.file })
    }
}

/// Holds the write lock until dropped.
#[derive(Debug)]
pub struct WriteLockGuard<'a> {
    file: &'a File,
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(error = %e, "failed to release write lock");
        }
    }
}

fn open_lock_file(path: &Path) -> CoreResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_is_busy() {
        let dir = tempdir().unwrap();
        let token = ProcessLock::acquire_exclusive(dir.path()).unwrap();
        assert_eq!(token.path(), dir.path().join(LOCK_FILE));

        let second = ProcessLock::acquire_exclusive(dir.path());
        assert!(matches!(second, Err(CoreError::LockBusy { .. })));

        ProcessLock::release(token).unwrap();
        ProcessLock::acquire_exclusive(dir.path()).unwrap();
    }

    #[test]
    fn dropping_token_releases() {
        let dir = tempdir().unwrap();
        drop(ProcessLock::acquire_exclusive(dir.path()).unwrap());
        assert!(ProcessLock::acquire_exclusive(dir.path()).is_ok());
    }

    #[test]
    fn write_lock_is_reentrant_after_drop() {
        let dir = tempdir().unwrap();
        let lock = WriteLock::open(dir.path()).unwrap();
        drop(lock.lock().unwrap());
        let _guard = lock.lock().unwrap();
        assert!(dir.path().join(WRITE_LOCK_FILE).exists());
    }
}
