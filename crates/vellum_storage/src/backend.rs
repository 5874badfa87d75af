//! The byte-store trait.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// Backends never interpret what they hold. The WAL, datafiles and manifest
/// all define their own framing on top of this trait.
///
/// # Invariants
///
/// - `append` returns the offset the bytes were written at, which equals
///   `size()` before the call
/// - `read_at` returns exactly the bytes previously appended there
/// - after `flush` returns, appended bytes survive a process crash
/// - after `sync` returns, appended bytes and the store length survive
///   power loss
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not fully
    /// inside the store, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes appended bytes out of process buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the store length in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the length cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Makes appended bytes and the store length durable on the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the store down to `new_size` bytes.
    ///
    /// Used to drop a torn WAL tail and to reset a fully collected log.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::InvalidTruncate`] if `new_size` is past
    /// the end, or an I/O error.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads the whole store.
    ///
    /// # Errors
    ///
    /// Returns an error if the size or the read fails.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| crate::StorageError::ReadPastEnd {
            offset: 0,
            len: usize::MAX,
            size,
        })?;
        self.read_at(0, len)
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        (**self).read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        (**self).append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        (**self).flush()
    }

    fn size(&self) -> StorageResult<u64> {
        (**self).size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        (**self).sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        (**self).truncate(new_size)
    }
}
