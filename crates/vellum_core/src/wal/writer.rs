//! WAL writer.

use crate::error::{CoreError, CoreResult};
use crate::types::SequenceNumber;
use crate::wal::iterator::{scan, WalScan};
use crate::wal::record::{encode_entry, WalRecord};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use vellum_storage::fault::{points, FaultController};
use vellum_storage::StorageBackend;

struct WriterState {
    backend: Box<dyn StorageBackend>,
    size: u64,
    next_sequence: u64,
}

/// Single-writer append-only log.
///
/// Every append encodes the entries, writes them with one backend call and
/// flushes, all under one mutex. A batch therefore lands contiguously and
/// sequence numbers follow write order.
pub struct WalWriter {
    state: Mutex<WriterState>,
    faults: Arc<dyn FaultController>,
    max_size: u64,
}

impl WalWriter {
    /// Wraps an already validated log. `next_sequence` is the number the
    /// next entry receives.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(
        backend: Box<dyn StorageBackend>,
        next_sequence: SequenceNumber,
        max_size: u64,
        faults: Arc<dyn FaultController>,
    ) -> CoreResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            state: Mutex::new(WriterState {
                backend,
                size,
                next_sequence: next_sequence.as_u64().max(1),
            }),
            faults,
            max_size,
        })
    }

    /// Appends one record and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails or the
    /// `CreateJournalDocumentCollection` fail point fires, and
    /// [`CoreError::ResourceLimit`] if the log would exceed its size cap.
    pub fn append(&self, record: &WalRecord) -> CoreResult<SequenceNumber> {
        let (first, _) = self.append_batch(std::slice::from_ref(record))?;
        Ok(first)
    }

    /// Appends records contiguously and returns the first and last sequence.
    ///
    /// # Errors
    ///
    /// Same as [`WalWriter::append`]; also fails on an empty batch. On error
    /// nothing was appended.
    pub fn append_batch(
        &self,
        records: &[WalRecord],
    ) -> CoreResult<(SequenceNumber, SequenceNumber)> {
        if records.is_empty() {
            return Err(CoreError::invalid_argument("empty WAL batch"));
        }
        let mut state = self.state.lock();
        self.faults.check(points::CREATE_JOURNAL)?;

        let first = state.next_sequence;
        let mut data = Vec::new();
        for (i, record) in records.iter().enumerate() {
            data.extend(encode_entry(SequenceNumber::new(first + i as u64), record)?);
        }
        if state.size + data.len() as u64 > self.max_size {
            return Err(CoreError::ResourceLimit {
                resource: "WAL size",
                limit: self.max_size,
            });
        }

        let offset = state.backend.append(&data)?;
        if let Err(err) = state.backend.flush() {
            // Leave no partial batch behind for later appends to follow.
            let _ = state.backend.truncate(offset);
            return Err(err.into());
        }
        state.size = offset + data.len() as u64;
        let last = first + records.len() as u64 - 1;
        state.next_sequence = last + 1;
        Ok((SequenceNumber::new(first), SequenceNumber::new(last)))
    }

    /// Makes everything appended so far durable on the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.state.lock().backend.sync()?;
        Ok(())
    }

    /// Returns the current log size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Returns the sequence of the last appended entry (0 if none ever).
    #[must_use]
    pub fn last_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.state.lock().next_sequence - 1)
    }

    /// Reads back the whole log.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the log is corrupted.
    pub fn scan(&self) -> CoreResult<WalScan> {
        let data = self.state.lock().backend.read_all()?;
        scan(&data)
    }

    /// Empties the log. Sequence numbering continues where it was.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation fails.
    pub fn reset(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.backend.truncate(0)?;
        state.backend.sync()?;
        state.size = 0;
        Ok(())
    }
}

impl fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalWriter")
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use vellum_storage::{FailPoints, InMemoryBackend, NoFaults};

    fn writer_with(faults: Arc<dyn FaultController>, max_size: u64) -> (WalWriter, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let writer = WalWriter::new(
            Box::new(backend.clone()),
            SequenceNumber::new(1),
            max_size,
            faults,
        )
        .unwrap();
        (writer, backend)
    }

    fn commit(txid: u64) -> WalRecord {
        WalRecord::Commit {
            txid: TransactionId::new(txid),
        }
    }

    #[test]
    fn append_assigns_gap_free_sequences() {
        let (writer, _) = writer_with(Arc::new(NoFaults), u64::MAX);
        assert_eq!(writer.append(&commit(1)).unwrap(), SequenceNumber::new(1));
        let (first, last) = writer
            .append_batch(&[commit(2), commit(3), commit(4)])
            .unwrap();
        assert_eq!((first.as_u64(), last.as_u64()), (2, 4));

        let sequences: Vec<u64> = writer
            .scan()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.sequence.as_u64())
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(writer.last_sequence(), SequenceNumber::new(4));
    }

    #[test]
    fn appended_entries_survive_crash() {
        let (writer, backend) = writer_with(Arc::new(NoFaults), u64::MAX);
        writer.append(&commit(1)).unwrap();
        backend.simulate_crash();
        assert_eq!(scan(&backend.data()).unwrap().entries.len(), 1);
    }

    #[test]
    fn journal_fault_fails_every_append() {
        let faults = Arc::new(FailPoints::new());
        let (writer, backend) = writer_with(faults.clone(), u64::MAX);
        faults.set_fail_at(points::CREATE_JOURNAL);

        let err = writer.append(&commit(1)).unwrap_err();
        assert!(err.is_io());
        assert!(backend.data().is_empty());

        faults.clear_all();
        assert_eq!(writer.append(&commit(1)).unwrap(), SequenceNumber::new(1));
    }

    #[test]
    fn size_cap_is_a_resource_limit() {
        let (writer, _) = writer_with(Arc::new(NoFaults), 40);
        writer.append(&commit(1)).unwrap();
        assert!(matches!(
            writer.append(&commit(2)),
            Err(CoreError::ResourceLimit { .. })
        ));
    }

    #[test]
    fn reset_keeps_numbering() {
        let (writer, _) = writer_with(Arc::new(NoFaults), u64::MAX);
        writer.append_batch(&[commit(1), commit(2)]).unwrap();
        writer.reset().unwrap();
        assert_eq!(writer.size(), 0);
        assert_eq!(writer.append(&commit(3)).unwrap(), SequenceNumber::new(3));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let (writer, _) = writer_with(Arc::new(NoFaults), u64::MAX);
        assert!(writer.append_batch(&[]).is_err());
    }
}
