//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ data.sdb          # Encrypted record blocks
//! ├─ wal.log           # Write-ahead log
//! ├─ LOCK              # Held while the database is open
//! └─ WRITE.LOCK        # Held around recovery, checkpoint and compaction
//! ```

use crate::error::{CoreError, CoreResult};
use crate::lock::{LockToken, ProcessLock, WriteLock, WriteLockGuard};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// File name of the data file inside a database directory.
pub const DATA_FILE: &str = "data.sdb";
/// File name of the write-ahead log inside a database directory.
pub const WAL_FILE: &str = "wal.log";
/// Compaction output, renamed over the data file once synced.
const COMPACT_FILE: &str = "data.sdb.compact";

/// An open database directory.
///
/// Holds the process lock until [`DatabaseDir::release`] or drop, so at
/// most one `DatabaseDir` exists per directory at a time.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    lock: Mutex<Option<LockToken>>,
    write_lock: WriteLock,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its process lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the directory doesn't exist and `create_if_missing` is false
    /// - another handle holds the lock ([`CoreError::LockBusy`])
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::not_found(format!(
                    "database directory {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock = ProcessLock::acquire_exclusive(path)?;
        let write_lock = WriteLock::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(Some(lock)),
            write_lock,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the data file.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.path.join(DATA_FILE)
    }

    /// Returns the path of the WAL file.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Returns the path compaction writes to.
    #[must_use]
    pub fn compact_path(&self) -> PathBuf {
        self.path.join(COMPACT_FILE)
    }

    /// Blocks until the write lock is held.
    ///
    /// # Errors
    ///
    /// Returns an error if locking fails.
    pub fn write_lock(&self) -> CoreResult<WriteLockGuard<'_>> {
        self.write_lock.lock()
    }

    /// Atomically replaces the data file with the compaction output.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename or directory sync fails.
    pub fn install_compacted(&self) -> CoreResult<()> {
        fs::rename(self.compact_path(), self.data_path())?;
        self.sync_directory()
    }

    /// Removes a compaction output left behind by a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and cannot be removed.
    pub fn remove_stale_compaction(&self) -> CoreResult<()> {
        let path = self.compact_path();
        if path.exists() {
            tracing::warn!(path = %path.display(), "removing unfinished compaction output");
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Releases the process lock. Calling it again does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the unlock call fails.
    pub fn release(&self) -> CoreResult<()> {
        match self.lock.lock().take() {
            Some(token) => ProcessLock::release(token),
            None => Ok(()),
        }
    }

    /// Makes renames and file creations in the directory durable.
    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let root = tempdir().unwrap();
        let path = root.path().join("db");
        let dir = DatabaseDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.data_path(), path.join("data.sdb"));
        assert_eq!(dir.wal_path(), path.join("wal.log"));
    }

    #[test]
    fn missing_directory_without_create() {
        let root = tempdir().unwrap();
        let result = DatabaseDir::open(&root.path().join("nope"), false);
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn second_open_is_busy() {
        let root = tempdir().unwrap();
        let _dir = DatabaseDir::open(root.path(), true).unwrap();
        assert!(matches!(
            DatabaseDir::open(root.path(), true),
            Err(CoreError::LockBusy { .. })
        ));
    }

    #[test]
    fn release_allows_reopen() {
        let root = tempdir().unwrap();
        let dir = DatabaseDir::open(root.path(), true).unwrap();
        dir.release().unwrap();
        dir.release().unwrap();
        DatabaseDir::open(root.path(), true).unwrap();
    }

    #[test]
    fn install_compacted_replaces_data_file() {
        let root = tempdir().unwrap();
        let dir = DatabaseDir::open(root.path(), true).unwrap();
        fs::write(dir.data_path(), b"old").unwrap();
        fs::write(dir.compact_path(), b"new").unwrap();
        dir.install_compacted().unwrap();
        assert_eq!(fs::read(dir.data_path()).unwrap(), b"new");
        assert!(!dir.compact_path().exists());
    }
}
