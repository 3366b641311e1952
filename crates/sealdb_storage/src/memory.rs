//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory storage backend.
///
/// Clones share the same buffer. A test can keep one clone, hand the other
/// to a database, drop the database without closing it and then reopen a
/// fresh database over the surviving bytes, which is how crash recovery is
/// exercised without touching the file system.
///
/// ```rust
/// use sealdb_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let observer = backend.clone();
/// backend.append(b"block").unwrap();
/// assert_eq!(observer.size().unwrap(), 5);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of all stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// XORs the byte at `offset` with `mask`.
    ///
    /// Returns `false` if `offset` is out of range.
    pub fn flip_byte(&self, offset: usize, mask: u8) -> bool {
        match self.data.write().get_mut(offset) {
            Some(byte) => {
                *byte ^= mask;
                true
            }
            None => false,
        }
    }

    /// Removes the last `count` bytes, simulating a torn write.
    pub fn chop(&self, count: usize) {
        let mut data = self.data.write();
        let keep = data.len().saturating_sub(count);
        data.truncate(keep);
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        // end <= data.len(), so both bounds fit in usize
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.data().is_empty());
    }

    #[test]
    fn clones_share_the_buffer() {
        let mut writer = InMemoryBackend::new();
        let reader = writer.clone();

        writer.append(b"shared").unwrap();
        assert_eq!(reader.read_at(0, 6).unwrap(), b"shared");

        drop(writer);
        assert_eq!(reader.data(), b"shared");
    }

    #[test]
    fn read_extending_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();

        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(backend.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn flip_byte_changes_one_position() {
        let mut backend = InMemoryBackend::new();
        backend.append(&[0u8; 4]).unwrap();

        assert!(backend.flip_byte(2, 0xff));
        assert!(!backend.flip_byte(4, 0xff));
        assert_eq!(backend.data(), vec![0, 0, 0xff, 0]);
    }

    #[test]
    fn chop_removes_tail() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"entry-one|entry-two").unwrap();

        backend.chop(4);
        assert_eq!(backend.data(), b"entry-one|entry");
        backend.chop(100);
        assert_eq!(backend.size().unwrap(), 0);
    }

    #[test]
    fn truncate_to_larger_size_fails() {
        let mut backend = InMemoryBackend::with_data(b"abc".to_vec());
        assert!(backend.truncate(4).is_err());
        backend.truncate(1).unwrap();
        assert_eq!(backend.data(), b"a");
    }

    proptest! {
        #[test]
        fn appended_chunks_read_back_in_place(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..16)) {
            let mut backend = InMemoryBackend::new();
            let offsets: Vec<u64> = chunks.iter().map(|c| backend.append(c).unwrap()).collect();

            for (chunk, offset) in chunks.iter().zip(offsets) {
                prop_assert_eq!(&backend.read_at(offset, chunk.len()).unwrap(), chunk);
            }
        }
    }
}
