//! Crash recovery testing for SealDB.
//!
//! A [`CrashHarness`] owns a temporary database directory. Tests open the
//! database, abandon it with [`CrashHarness::crash`] (no checkpoint, no
//! clean close), optionally damage the files the way a dying process or a
//! bad disk would, and reopen.
//!
//! ## Test Strategy
//!
//! 1. **Crash after commit** - committed data must survive
//! 2. **Crash before commit** - uncommitted data must be absent
//! 3. **Torn WAL tail** - a partially written batch must vanish as a whole
//! 4. **Damaged data block** - reads of that record fail as tampered
//! 5. **Forged block header** - a rewritten header with a valid checksum
//!    is caught by the body's authentication tag

use sealdb_core::store::{BlockHeader, BLOCK_HEADER_SIZE};
use sealdb_core::{Config, CoreResult, Database, DATA_FILE, WAL_FILE};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::fixtures::{test_config, TEST_PASSPHRASE};

/// Owns a database directory that survives simulated crashes.
pub struct CrashHarness {
    dir: TempDir,
    config: Config,
}

impl CrashHarness {
    /// Creates a harness over a fresh directory with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a harness that opens with `config`.
    pub fn with_config(config: Config) -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp directory"),
            config,
        }
    }

    /// Returns the database directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the data file path.
    pub fn data_path(&self) -> PathBuf {
        self.dir.path().join(DATA_FILE)
    }

    /// Returns the WAL path.
    pub fn wal_path(&self) -> PathBuf {
        self.dir.path().join(WAL_FILE)
    }

    /// Opens the database, panicking on failure.
    pub fn open(&self) -> Database {
        self.try_open().expect("failed to open database")
    }

    /// Opens the database with the harness passphrase.
    ///
    /// # Errors
    ///
    /// Whatever [`Database::open_with_config`] returns.
    pub fn try_open(&self) -> CoreResult<Database> {
        self.try_open_with(TEST_PASSPHRASE)
    }

    /// Opens the database with `passphrase`.
    ///
    /// # Errors
    ///
    /// Whatever [`Database::open_with_config`] returns.
    pub fn try_open_with(&self, passphrase: &[u8]) -> CoreResult<Database> {
        Database::open_with_config(self.dir.path(), passphrase, self.config.clone())
    }

    /// Abandons `db` without a checkpoint. Whatever was committed is in the
    /// WAL; nothing else is.
    pub fn crash(&self, db: Database) {
        db.simulate_crash();
    }

    /// Current WAL length in bytes.
    pub fn wal_len(&self) -> u64 {
        file_len(&self.wal_path())
    }

    /// Current data file length in bytes.
    pub fn data_len(&self) -> u64 {
        file_len(&self.data_path())
    }

    /// Cuts the WAL to `len` bytes, as if the process died while writing.
    pub fn truncate_wal(&self, len: u64) {
        let file = OpenOptions::new()
            .write(true)
            .open(self.wal_path())
            .expect("open WAL");
        file.set_len(len).expect("truncate WAL");
    }

    /// Appends `bytes` to the WAL.
    pub fn append_to_wal(&self, bytes: &[u8]) {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.wal_path())
            .expect("open WAL");
        file.write_all(bytes).expect("append to WAL");
    }

    /// Inverts the data file byte at `offset`.
    pub fn flip_data_byte_at(&self, offset: u64) {
        assert!(offset < self.data_len(), "offset outside the data file");
        flip_byte(&self.data_path(), offset);
    }

    /// Offsets and headers of every block in the data file whose header
    /// checksum holds, in file order.
    pub fn data_blocks(&self) -> Vec<(u64, BlockHeader)> {
        let bytes = fs::read(self.data_path()).expect("read data file");
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset + BLOCK_HEADER_SIZE <= bytes.len() {
            match BlockHeader::decode(&bytes[offset..]) {
                Ok(header) => {
                    blocks.push((offset as u64, header));
                    offset += usize::try_from(header.block_len()).expect("block fits in memory");
                }
                Err(_) => offset += 1,
            }
        }
        blocks
    }

    /// Rewrites the header of the block at `offset` and recomputes its
    /// checksum, the way someone editing the file on purpose would.
    pub fn forge_block_header(&self, offset: u64, edit: impl FnOnce(&mut BlockHeader)) {
        let path = self.data_path();
        let mut bytes = fs::read(&path).expect("read data file");
        let at = usize::try_from(offset).expect("file fits in memory");
        let mut header = BlockHeader::decode(&bytes[at..]).expect("intact block header");
        edit(&mut header);
        bytes[at..at + BLOCK_HEADER_SIZE].copy_from_slice(&header.encode());
        fs::write(&path, bytes).expect("write data file");
    }

    /// Inverts the WAL byte at `offset`.
    pub fn flip_wal_byte(&self, offset: u64) {
        assert!(offset < self.wal_len(), "offset outside the WAL");
        flip_byte(&self.wal_path(), offset);
    }
}

fn flip_byte(path: &Path, offset: u64) {
    let mut bytes = fs::read(path).expect("read file");
    let index = usize::try_from(offset).expect("file fits in memory");
    bytes[index] ^= 0xFF;
    fs::write(path, bytes).expect("write file");
}

impl Default for CrashHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map_or(0, |m| m.len())
}
