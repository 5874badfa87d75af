//! File-backed byte store.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct OpenFile {
    file: File,
    len: u64,
}

/// A byte store on an OS file.
///
/// `flush` hands buffered bytes to the kernel, `sync` calls `sync_all`.
/// One mutex guards the handle and the cached length so appends and reads
/// never interleave a seek.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<OpenFile>,
}

impl FileBackend {
    /// Opens `path`, creating an empty file if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(OpenFile { file, len }),
        })
    }

    /// Opens `path` after creating any missing parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory or the file cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let size = inner.len;
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let mut buf = vec![0u8; len];
        if len > 0 {
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let inner = self.inner.get_mut();
        let offset = inner.len;
        if !data.is_empty() {
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.write_all(data)?;
            inner.len += data.len() as u64;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.get_mut().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let inner = self.inner.get_mut();
        inner.file.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let inner = self.inner.get_mut();
        if new_size > inner.len {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: inner.len,
            });
        }
        inner.file.set_len(new_size)?;
        inner.file.sync_all()?;
        inner.len = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let backend = FileBackend::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(backend.size().unwrap(), 0);
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("a.bin")).unwrap();
        assert_eq!(backend.append(b"hello ").unwrap(), 0);
        assert_eq!(backend.append(b"world").unwrap(), 6);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
        assert_eq!(backend.read_all().unwrap(), b"hello world");
        assert!(backend.read_at(8, 10).is_err());
    }

    #[test]
    fn bytes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("p.bin");
        {
            let mut backend = FileBackend::open_with_create_dirs(&path).unwrap();
            backend.append(b"persisted").unwrap();
            backend.sync().unwrap();
        }
        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"persisted");
    }

    #[test]
    fn truncate_then_append_continues_at_new_end() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("t.bin")).unwrap();
        backend.append(b"abcdef").unwrap();
        backend.truncate(3).unwrap();
        assert_eq!(backend.append(b"XY").unwrap(), 3);
        assert_eq!(backend.read_all().unwrap(), b"abcXY");
        assert!(matches!(
            backend.truncate(99),
            Err(StorageError::InvalidTruncate { .. })
        ));
    }
}
