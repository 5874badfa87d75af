//! In-memory byte store with crash simulation.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemoryFile {
    data: Vec<u8>,
    /// Bytes that survive [`InMemoryBackend::simulate_crash`].
    flushed: usize,
}

/// An in-memory backend.
///
/// Cloning yields a second handle onto the same bytes. A [`crate::MemoryVolume`]
/// hands out such clones so that a re-opened engine sees what the previous
/// one wrote.
///
/// ```rust
/// use vellum_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.append(b"durable").unwrap();
/// backend.flush().unwrap();
/// backend.append(b"lost").unwrap();
///
/// backend.simulate_crash();
/// assert_eq!(backend.data(), b"durable");
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    file: Arc<RwLock<MemoryFile>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding `data`, all of it considered flushed.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let flushed = data.len();
        Self {
            file: Arc::new(RwLock::new(MemoryFile { data, flushed })),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.file.read().data.clone()
    }

    /// Returns the number of bytes that would survive a crash.
    #[must_use]
    pub fn flushed_len(&self) -> usize {
        self.file.read().flushed
    }

    /// Drops every byte appended after the last flush.
    pub fn simulate_crash(&self) {
        let mut file = self.file.write();
        let flushed = file.flushed;
        file.data.truncate(flushed);
    }

    /// Overwrites `len` bytes at `offset` with garbage.
    ///
    /// Test helper for corruption scenarios. Out-of-range requests are
    /// clamped.
    pub fn corrupt(&self, offset: usize, len: usize) {
        let mut file = self.file.write();
        let end = offset.saturating_add(len).min(file.data.len());
        for byte in file.data.iter_mut().take(end).skip(offset) {
            *byte ^= 0xA5;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let file = self.file.read();
        let size = file.data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let start = offset as usize;
        Ok(file.data[start..start + len].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.write();
        let offset = file.data.len() as u64;
        file.data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.flushed = file.data.len();
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.file.read().data.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.flush()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut file = self.file.write();
        let size = file.data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        file.data.truncate(new_size as usize);
        file.flushed = file.flushed.min(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_running_offset() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"abc").unwrap(), 0);
        assert_eq!(backend.append(b"de").unwrap(), 3);
        assert_eq!(backend.size().unwrap(), 5);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"abc").unwrap();
        assert!(matches!(
            backend.read_at(2, 5),
            Err(StorageError::ReadPastEnd { size: 3, .. })
        ));
    }

    #[test]
    fn clones_share_bytes() {
        let mut a = InMemoryBackend::new();
        let b = a.clone();
        a.append(b"shared").unwrap();
        assert_eq!(b.data(), b"shared");
    }

    #[test]
    fn crash_keeps_only_flushed_prefix() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"one").unwrap();
        backend.sync().unwrap();
        backend.append(b"two").unwrap();
        assert_eq!(backend.flushed_len(), 3);

        backend.simulate_crash();
        assert_eq!(backend.data(), b"one");
    }

    #[test]
    fn truncate_clamps_flushed_mark() {
        let mut backend = InMemoryBackend::with_data(b"abcdef".to_vec());
        backend.truncate(2).unwrap();
        assert_eq!(backend.flushed_len(), 2);
        assert!(matches!(
            backend.truncate(10),
            Err(StorageError::InvalidTruncate { .. })
        ));
    }

    #[test]
    fn corrupt_flips_bytes_in_range() {
        let backend = InMemoryBackend::with_data(vec![0u8; 4]);
        backend.corrupt(1, 2);
        assert_eq!(backend.data(), vec![0, 0xA5, 0xA5, 0]);
        backend.corrupt(3, 100);
        assert_eq!(backend.data()[3], 0xA5);
    }
}
