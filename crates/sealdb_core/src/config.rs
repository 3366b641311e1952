//! Database configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Argon2id cost parameters used to stretch the passphrase.
///
/// The parameters a database was created with are stored in its data file
/// header, so changing [`Config::kdf`] only affects new databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and throwaway databases.
    #[must_use]
    pub const fn low_cost() -> Self {
        Self {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to fsync the WAL on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Serialized payloads shorter than this are stored uncompressed.
    pub compression_threshold: usize,

    /// zstd compression level.
    pub compression_level: i32,

    /// How long a commit leader waits for more transactions to join its batch.
    pub group_commit_window: Duration,

    /// WAL size that triggers an automatic checkpoint after a commit (0 = never).
    pub checkpoint_wal_bytes: u64,

    /// Whether `close` checkpoints before releasing the database.
    pub checkpoint_on_close: bool,

    /// Whether inserts and updates stamp `_created_at` / `_updated_at`.
    pub record_timestamps: bool,

    /// Key derivation cost for new databases.
    pub kdf: KdfParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            compression_threshold: 64,
            compression_level: 3,
            group_commit_window: Duration::ZERO,
            checkpoint_wal_bytes: 4 * 1024 * 1024, // 4 MB
            checkpoint_on_close: true,
            record_timestamps: false,
            kdf: KdfParams::default(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the WAL on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the minimum payload size considered for compression.
    #[must_use]
    pub const fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    /// Sets the zstd compression level.
    #[must_use]
    pub const fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Sets the group commit window.
    #[must_use]
    pub const fn group_commit_window(mut self, window: Duration) -> Self {
        self.group_commit_window = window;
        self
    }

    /// Sets the WAL size that triggers an automatic checkpoint.
    #[must_use]
    pub const fn checkpoint_wal_bytes(mut self, bytes: u64) -> Self {
        self.checkpoint_wal_bytes = bytes;
        self
    }

    /// Sets whether `close` checkpoints.
    #[must_use]
    pub const fn checkpoint_on_close(mut self, value: bool) -> Self {
        self.checkpoint_on_close = value;
        self
    }

    /// Sets whether documents carry creation/update timestamps.
    #[must_use]
    pub const fn record_timestamps(mut self, value: bool) -> Self {
        self.record_timestamps = value;
        self
    }

    /// Sets the key derivation parameters for new databases.
    #[must_use]
    pub const fn kdf(mut self, params: KdfParams) -> Self {
        self.kdf = params;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert!(config.checkpoint_on_close);
        assert!(!config.record_timestamps);
        assert_eq!(config.compression_level, 3);
        assert_eq!(config.kdf, KdfParams::default());
        assert_eq!(config.group_commit_window, Duration::ZERO);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .sync_on_commit(false)
            .compression_threshold(0)
            .checkpoint_wal_bytes(1024)
            .group_commit_window(Duration::from_millis(2))
            .kdf(KdfParams::low_cost());

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.compression_threshold, 0);
        assert_eq!(config.checkpoint_wal_bytes, 1024);
        assert_eq!(config.group_commit_window, Duration::from_millis(2));
        assert_eq!(config.kdf.memory_kib, 256);
    }
}
