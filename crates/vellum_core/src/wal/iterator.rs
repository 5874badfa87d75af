//! WAL entry iterator.
//!
//! Walks an in-memory copy of the log entry by entry. The iterator stops
//! cleanly at a torn tail and fails on anything that looks like damage to
//! a complete entry.

use crate::error::{CoreError, CoreResult};
use crate::types::SequenceNumber;
use crate::wal::record::{
    WalEntry, WalEntryKind, WalRecord, CRC_SIZE, HEADER_FIELDS_SIZE, HEADER_SIZE, WAL_MAGIC,
    WAL_VERSION,
};

/// Iterates `(offset, entry)` pairs over raw WAL bytes.
///
/// # Error Handling
///
/// - partial header or payload at the end: clean end of log
/// - bad magic, header CRC mismatch, unsupported version, unknown kind:
///   `WalCorruption`
/// - entry CRC mismatch: `ChecksumMismatch`
/// - sequence not following the previous one: `WalCorruption`
#[derive(Debug)]
pub struct WalIterator<'a> {
    data: &'a [u8],
    offset: usize,
    last_sequence: Option<SequenceNumber>,
    finished: bool,
}

impl<'a> WalIterator<'a> {
    /// Creates an iterator over `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            last_sequence: None,
            finished: false,
        }
    }

    /// Returns the end offset of the last complete entry read so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.offset as u64
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, WalEntry)>> {
        let start = self.offset;
        let remaining = &self.data[start..];
        if remaining.len() < HEADER_SIZE {
            return Ok(None);
        }
        if remaining[0..4] != WAL_MAGIC {
            return Err(CoreError::wal_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }
        let mut header_crc = [0u8; 4];
        header_crc.copy_from_slice(&remaining[HEADER_FIELDS_SIZE..HEADER_SIZE]);
        if u32::from_le_bytes(header_crc) != crc32fast::hash(&remaining[..HEADER_FIELDS_SIZE]) {
            return Err(CoreError::wal_corruption(format!(
                "header checksum mismatch at offset {start}"
            )));
        }
        let version = remaining[4];
        if version == 0 || version > WAL_VERSION {
            return Err(CoreError::wal_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }
        let kind_byte = remaining[5];
        let kind = WalEntryKind::from_byte(kind_byte).ok_or_else(|| {
            CoreError::wal_corruption(format!(
                "unknown entry kind {kind_byte} at offset {start}"
            ))
        })?;
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&remaining[6..14]);
        let sequence = SequenceNumber::new(u64::from_le_bytes(seq_bytes));
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&remaining[14..18]);
        let payload_len = u32::from_le_bytes(len_bytes) as usize;

        let total = HEADER_SIZE + payload_len + CRC_SIZE;
        if remaining.len() < total {
            return Ok(None);
        }

        let body_end = HEADER_SIZE + payload_len;
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&remaining[body_end..total]);
        let expected = u32::from_le_bytes(crc_bytes);
        let actual = crc32fast::hash(&remaining[..body_end]);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        if let Some(last) = self.last_sequence {
            if sequence.as_u64() != last.as_u64() + 1 {
                return Err(CoreError::wal_corruption(format!(
                    "sequence {sequence} after {last} at offset {start}"
                )));
            }
        }

        let record = WalRecord::decode_payload(kind, &remaining[HEADER_SIZE..body_end])?;
        self.offset = start + total;
        self.last_sequence = Some(sequence);
        Ok(Some((start as u64, WalEntry { sequence, record })))
    }
}

impl Iterator for WalIterator<'_> {
    type Item = CoreResult<(u64, WalEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// The result of reading a whole log.
#[derive(Debug, Clone, Default)]
pub struct WalScan {
    /// Complete entries in log order.
    pub entries: Vec<WalEntry>,
    /// Length of the log up to the end of the last complete entry.
    pub valid_len: u64,
    /// Bytes past `valid_len` (a torn tail).
    pub torn_bytes: u64,
}

impl WalScan {
    /// Returns the sequence of the last complete entry.
    #[must_use]
    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.entries.last().map(|entry| entry.sequence)
    }
}

/// Reads every complete entry of `data`.
///
/// # Errors
///
/// Returns the first corruption error encountered.
pub fn scan(data: &[u8]) -> CoreResult<WalScan> {
    let mut iter = WalIterator::new(data);
    let mut entries = Vec::new();
    for item in iter.by_ref() {
        let (_, entry) = item?;
        entries.push(entry);
    }
    let valid_len = iter.valid_len();
    Ok(WalScan {
        entries,
        valid_len,
        torn_bytes: data.len() as u64 - valid_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use crate::wal::record::encode_entry;

    fn log_of(records: &[WalRecord]) -> Vec<u8> {
        let mut data = Vec::new();
        for (i, record) in records.iter().enumerate() {
            data.extend(encode_entry(SequenceNumber::new(i as u64 + 1), record).unwrap());
        }
        data
    }

    fn commits(n: u64) -> Vec<WalRecord> {
        (1..=n)
            .map(|i| WalRecord::Commit {
                txid: TransactionId::new(i),
            })
            .collect()
    }

    #[test]
    fn empty_log_scans_empty() {
        let scan = scan(&[]).unwrap();
        assert!(scan.entries.is_empty());
        assert_eq!(scan.valid_len, 0);
        assert_eq!(scan.last_sequence(), None);
    }

    #[test]
    fn offsets_point_at_entry_starts() {
        let data = log_of(&commits(3));
        let offsets: Vec<u64> = WalIterator::new(&data)
            .map(|item| item.unwrap().0)
            .collect();
        let entry_len = (HEADER_SIZE + 8 + CRC_SIZE) as u64;
        assert_eq!(offsets, vec![0, entry_len, 2 * entry_len]);
    }

    #[test]
    fn torn_tail_ends_log_cleanly() {
        let data = log_of(&commits(3));
        let full = data.len();
        for cut in [full - 1, full - CRC_SIZE, full - 12, full - 20] {
            let scan = scan(&data[..cut]).unwrap();
            assert_eq!(scan.entries.len(), 2, "cut at {cut}");
            assert_eq!(scan.torn_bytes, cut as u64 - scan.valid_len);
        }
    }

    #[test]
    fn flipped_payload_byte_is_checksum_mismatch() {
        let mut data = log_of(&commits(2));
        data[HEADER_SIZE + 1] ^= 0xFF;
        assert!(matches!(
            scan(&data),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_and_kind_are_fatal() {
        let mut data = log_of(&commits(1));
        data[0] = b'X';
        assert!(matches!(scan(&data), Err(CoreError::WalCorruption { .. })));

        let mut data = log_of(&commits(1));
        data[5] = 42;
        assert!(matches!(scan(&data), Err(CoreError::WalCorruption { .. })));
    }

    #[test]
    fn damaged_length_is_fatal_not_torn() {
        let data = log_of(&commits(3));
        for byte in [HEADER_FIELDS_SIZE - 1, HEADER_FIELDS_SIZE - 4] {
            let mut damaged = data.clone();
            damaged[byte] = 0x7f;
            assert!(
                matches!(scan(&damaged), Err(CoreError::WalCorruption { .. })),
                "byte {byte}"
            );
        }

        let entry_len = HEADER_SIZE + 8 + CRC_SIZE;
        let mut damaged = data;
        damaged[entry_len + HEADER_FIELDS_SIZE - 2] ^= 0x01;
        let mut iter = WalIterator::new(&damaged);
        assert!(iter.next().unwrap().is_ok());
        assert!(matches!(
            iter.next(),
            Some(Err(CoreError::WalCorruption { .. }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn sequence_gap_is_fatal() {
        let record = WalRecord::Shutdown;
        let mut data = encode_entry(SequenceNumber::new(4), &record).unwrap();
        data.extend(encode_entry(SequenceNumber::new(6), &record).unwrap());
        assert!(matches!(scan(&data), Err(CoreError::WalCorruption { .. })));
    }

    #[test]
    fn log_may_start_at_any_sequence() {
        let record = WalRecord::Shutdown;
        let mut data = encode_entry(SequenceNumber::new(41), &record).unwrap();
        data.extend(encode_entry(SequenceNumber::new(42), &record).unwrap());
        assert_eq!(scan(&data).unwrap().entries.len(), 2);
    }

    #[test]
    fn repeated_sequence_is_fatal() {
        let record = WalRecord::Shutdown;
        let mut data = encode_entry(SequenceNumber::new(4), &record).unwrap();
        data.extend(encode_entry(SequenceNumber::new(4), &record).unwrap());
        assert!(matches!(scan(&data), Err(CoreError::WalCorruption { .. })));
    }
}
