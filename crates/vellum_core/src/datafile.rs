//! Collection datafiles.
//!
//! The collector moves committed WAL entries into one append-only datafile
//! per collection. Each record carries the WAL sequence it came from, so a
//! datafile knows the highest sequence it has applied and applying the same
//! entry twice is a no-op.
//!
//! ```text
//! | len (4) | flags (1) | sequence (8) | rev (8) | key_len (2) | key | body | crc32 (4) |
//! ```
//!
//! `len` counts the whole record. Flags: `0x01` tombstone, `0x02` watermark
//! (written by compaction to keep the applied sequence when the record that
//! carried it was dropped).
//!
//! ## Invariants
//!
//! - the latest record for a key wins; a tombstone hides the key
//! - `applied_seq` is the largest sequence of any record in the file
//! - a torn tail is cut off on open, a bad checksum is fatal

use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::types::{Revision, SequenceNumber};
use std::collections::BTreeMap;
use std::fmt;
use vellum_storage::StorageBackend;

const FLAG_TOMBSTONE: u8 = 0x01;
const FLAG_WATERMARK: u8 = 0x02;

/// len (4) + flags (1) + sequence (8) + rev (8) + key_len (2)
const HEADER_SIZE: usize = 23;
const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DatafileRecord {
    flags: u8,
    sequence: SequenceNumber,
    rev: Revision,
    key: String,
    body: Vec<u8>,
}

impl DatafileRecord {
    fn encode(&self) -> CoreResult<Vec<u8>> {
        let key_len = u16::try_from(self.key.len())
            .map_err(|_| CoreError::invalid_argument("document key too long"))?;
        let total = HEADER_SIZE + self.key.len() + self.body.len() + CRC_SIZE;
        let total_u32 = u32::try_from(total)
            .map_err(|_| CoreError::invalid_argument("document body too large"))?;

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&total_u32.to_le_bytes());
        buf.push(self.flags);
        buf.extend_from_slice(&self.sequence.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.rev.as_u64().to_le_bytes());
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(&self.body);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < HEADER_SIZE + CRC_SIZE {
            return Err(CoreError::datafile_corruption("record shorter than header"));
        }
        let body_end = bytes.len() - CRC_SIZE;
        let expected = u32::from_le_bytes(le4(&bytes[body_end..]));
        let actual = crc32fast::hash(&bytes[..body_end]);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
        let flags = bytes[4];
        let sequence = SequenceNumber::new(u64::from_le_bytes(le8(&bytes[5..13])));
        let rev = Revision::new(u64::from_le_bytes(le8(&bytes[13..21])));
        let key_len = usize::from(u16::from_le_bytes([bytes[21], bytes[22]]));
        let key_end = HEADER_SIZE + key_len;
        if key_end > body_end {
            return Err(CoreError::datafile_corruption("key length past record end"));
        }
        let key = std::str::from_utf8(&bytes[HEADER_SIZE..key_end])
            .map_err(|_| CoreError::datafile_corruption("key is not UTF-8"))?
            .to_string();
        Ok(Self {
            flags,
            sequence,
            rev,
            key,
            body: bytes[key_end..body_end].to_vec(),
        })
    }
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    out
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: usize,
    rev: Revision,
}

/// Size and liveness figures for a datafile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatafileStats {
    /// Live documents.
    pub live: u64,
    /// Records in the file, live or not.
    pub records: u64,
    /// File size in bytes.
    pub size: u64,
    /// Highest applied sequence.
    pub applied_seq: SequenceNumber,
    /// Bytes cut from a torn tail when the file was opened.
    pub torn_bytes: u64,
}

/// One collection's datafile with its in-memory key index.
pub struct Datafile {
    backend: Box<dyn StorageBackend>,
    index: BTreeMap<String, Slot>,
    applied_seq: SequenceNumber,
    max_rev: Revision,
    records: u64,
    size: u64,
    torn_bytes: u64,
}

impl Datafile {
    /// Opens a datafile, rebuilding the key index by scanning every record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChecksumMismatch`] or
    /// [`CoreError::DatafileCorruption`] for damaged records.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let data = backend.read_all()?;
        let mut index = BTreeMap::new();
        let mut applied_seq = SequenceNumber::default();
        let mut max_rev = Revision::default();
        let mut records = 0;
        let mut offset = 0usize;

        while data.len() - offset >= 4 {
            let len = u32::from_le_bytes(le4(&data[offset..])) as usize;
            if len < HEADER_SIZE + CRC_SIZE {
                return Err(CoreError::datafile_corruption(format!(
                    "record length {len} at offset {offset}"
                )));
            }
            if data.len() - offset < len {
                break;
            }
            let record = DatafileRecord::decode(&data[offset..offset + len])?;
            applied_seq = applied_seq.max(record.sequence);
            max_rev = max_rev.max(record.rev);
            records += 1;
            if record.flags & FLAG_WATERMARK == 0 {
                if record.flags & FLAG_TOMBSTONE != 0 {
                    index.remove(&record.key);
                } else {
                    index.insert(
                        record.key,
                        Slot {
                            offset: offset as u64,
                            len,
                            rev: record.rev,
                        },
                    );
                }
            }
            offset += len;
        }

        let torn_bytes = (data.len() - offset) as u64;
        if torn_bytes > 0 {
            tracing::warn!(torn_bytes, "cutting torn datafile tail");
            backend.truncate(offset as u64)?;
            backend.sync()?;
        }

        Ok(Self {
            backend,
            index,
            applied_seq,
            max_rev,
            records,
            size: offset as u64,
            torn_bytes,
        })
    }

    fn write(&mut self, record: &DatafileRecord) -> CoreResult<(u64, usize)> {
        let bytes = record.encode()?;
        let offset = self.backend.append(&bytes)?;
        self.size = offset + bytes.len() as u64;
        self.records += 1;
        Ok((offset, bytes.len()))
    }

    /// Stores a document version. Returns false if `sequence` was already
    /// applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn apply_put(
        &mut self,
        sequence: SequenceNumber,
        key: &str,
        rev: Revision,
        body: &[u8],
    ) -> CoreResult<bool> {
        if sequence <= self.applied_seq {
            return Ok(false);
        }
        let record = DatafileRecord {
            flags: 0,
            sequence,
            rev,
            key: key.to_string(),
            body: body.to_vec(),
        };
        let (offset, len) = self.write(&record)?;
        self.index
            .insert(key.to_string(), Slot { offset, len, rev });
        self.applied_seq = sequence;
        self.max_rev = self.max_rev.max(rev);
        Ok(true)
    }

    /// Removes a document. Returns false if `sequence` was already applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn apply_remove(
        &mut self,
        sequence: SequenceNumber,
        key: &str,
        rev: Revision,
    ) -> CoreResult<bool> {
        if sequence <= self.applied_seq {
            return Ok(false);
        }
        if self.index.contains_key(key) {
            let record = DatafileRecord {
                flags: FLAG_TOMBSTONE,
                sequence,
                rev,
                key: key.to_string(),
                body: Vec::new(),
            };
            self.write(&record)?;
            self.index.remove(key);
        }
        self.applied_seq = sequence;
        Ok(true)
    }

    /// Makes applied records durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }

    /// Reads a live document.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the record is damaged.
    pub fn get(&self, key: &str) -> CoreResult<Option<Document>> {
        let Some(slot) = self.index.get(key) else {
            return Ok(None);
        };
        let bytes = self.backend.read_at(slot.offset, slot.len)?;
        let record = DatafileRecord::decode(&bytes)?;
        Ok(Some(Document::from_body_bytes(
            record.key,
            record.rev,
            &record.body,
        )?))
    }

    /// Returns true if `key` is live.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the live revision of `key`.
    #[must_use]
    pub fn revision(&self, key: &str) -> Option<Revision> {
        self.index.get(key).map(|slot| slot.rev)
    }

    /// Returns live keys with their revisions, in key order.
    pub fn revisions(&self) -> impl Iterator<Item = (&str, Revision)> {
        self.index.iter().map(|(key, slot)| (key.as_str(), slot.rev))
    }

    /// Returns the number of live documents.
    #[must_use]
    pub fn live_count(&self) -> u64 {
        self.index.len() as u64
    }

    /// Returns the highest applied sequence.
    #[must_use]
    pub fn applied_seq(&self) -> SequenceNumber {
        self.applied_seq
    }

    /// Returns the highest revision stored.
    #[must_use]
    pub fn max_revision(&self) -> Revision {
        self.max_rev
    }

    /// Records that no longer hold a live document.
    #[must_use]
    pub fn dead_records(&self) -> u64 {
        self.records.saturating_sub(self.live_count())
    }

    /// Share of records that are no longer live.
    #[must_use]
    pub fn dead_ratio(&self) -> f64 {
        if self.records == 0 {
            return 0.0;
        }
        self.dead_records() as f64 / self.records as f64
    }

    /// Returns size and liveness figures.
    #[must_use]
    pub fn stats(&self) -> DatafileStats {
        DatafileStats {
            live: self.live_count(),
            records: self.records,
            size: self.size,
            applied_seq: self.applied_seq,
            torn_bytes: self.torn_bytes,
        }
    }

    /// Copies the live records and a watermark into `target`, syncs it and
    /// switches this datafile over to it.
    ///
    /// The caller swaps the files in the volume afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the old file or writing the new one
    /// fails. On error this datafile still uses the old file.
    pub fn rewrite(&mut self, target: Box<dyn StorageBackend>) -> CoreResult<()> {
        let mut compacted = Datafile {
            backend: target,
            index: BTreeMap::new(),
            applied_seq: SequenceNumber::default(),
            max_rev: self.max_rev,
            records: 0,
            size: 0,
            torn_bytes: 0,
        };
        if compacted.backend.size()? > 0 {
            compacted.backend.truncate(0)?;
        }

        for (key, slot) in &self.index {
            let bytes = self.backend.read_at(slot.offset, slot.len)?;
            let record = DatafileRecord::decode(&bytes)?;
            let (offset, len) = compacted.write(&record)?;
            compacted.index.insert(
                key.clone(),
                Slot {
                    offset,
                    len,
                    rev: slot.rev,
                },
            );
        }
        compacted.write(&DatafileRecord {
            flags: FLAG_WATERMARK,
            sequence: self.applied_seq,
            rev: self.max_rev,
            key: String::new(),
            body: Vec::new(),
        })?;
        compacted.applied_seq = self.applied_seq;
        compacted.backend.sync()?;

        let before = self.records;
        *self = compacted;
        tracing::debug!(before, after = self.records, "datafile compacted");
        Ok(())
    }
}

impl fmt::Debug for Datafile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datafile")
            .field("live", &self.index.len())
            .field("records", &self.records)
            .field("applied_seq", &self.applied_seq)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_storage::InMemoryBackend;

    fn seq(n: u64) -> SequenceNumber {
        SequenceNumber::new(n)
    }

    fn open(backend: &InMemoryBackend) -> Datafile {
        Datafile::open(Box::new(backend.clone())).unwrap()
    }

    #[test]
    fn put_get_and_remove() {
        let backend = InMemoryBackend::new();
        let mut file = open(&backend);
        assert!(file
            .apply_put(seq(1), "a", Revision::new(10), br#"{"v":1}"#)
            .unwrap());
        let doc = file.get("a").unwrap().unwrap();
        assert_eq!(doc.rev, Revision::new(10));
        assert_eq!(doc.body["v"], serde_json::json!(1));

        assert!(file.apply_remove(seq(2), "a", Revision::new(10)).unwrap());
        assert!(file.get("a").unwrap().is_none());
        assert_eq!(file.applied_seq(), seq(2));
    }

    #[test]
    fn applying_old_sequence_is_noop() {
        let backend = InMemoryBackend::new();
        let mut file = open(&backend);
        file.apply_put(seq(5), "a", Revision::new(1), b"{}").unwrap();
        assert!(!file.apply_put(seq(5), "a", Revision::new(2), b"{}").unwrap());
        assert!(!file.apply_remove(seq(3), "a", Revision::new(1)).unwrap());
        assert_eq!(file.revision("a"), Some(Revision::new(1)));
        assert_eq!(file.stats().records, 1);
    }

    #[test]
    fn reopen_rebuilds_index_and_watermark() {
        let backend = InMemoryBackend::new();
        {
            let mut file = open(&backend);
            file.apply_put(seq(1), "a", Revision::new(1), b"{}").unwrap();
            file.apply_put(seq(2), "b", Revision::new(2), b"{}").unwrap();
            file.apply_remove(seq(3), "a", Revision::new(1)).unwrap();
            file.sync().unwrap();
        }
        let file = open(&backend);
        assert_eq!(file.live_count(), 1);
        assert!(file.contains("b"));
        assert_eq!(file.applied_seq(), seq(3));
        assert_eq!(file.max_revision(), Revision::new(2));
    }

    #[test]
    fn torn_tail_is_cut() {
        let backend = InMemoryBackend::new();
        {
            let mut file = open(&backend);
            file.apply_put(seq(1), "a", Revision::new(1), b"{}").unwrap();
            file.apply_put(seq(2), "b", Revision::new(2), b"{}").unwrap();
            file.sync().unwrap();
        }
        let full = backend.data().len();
        let mut handle = backend.clone();
        handle.truncate(full as u64 - 3).unwrap();

        let file = open(&backend);
        assert_eq!(file.live_count(), 1);
        assert!(file.stats().torn_bytes > 0);
        assert_eq!(file.applied_seq(), seq(1));
    }

    #[test]
    fn flipped_byte_is_fatal() {
        let backend = InMemoryBackend::new();
        {
            let mut file = open(&backend);
            file.apply_put(seq(1), "a", Revision::new(1), br#"{"x":1}"#)
                .unwrap();
        }
        backend.corrupt(HEADER_SIZE + 2, 1);
        assert!(matches!(
            Datafile::open(Box::new(backend)),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rewrite_drops_dead_records_and_keeps_watermark() {
        let backend = InMemoryBackend::new();
        let mut file = open(&backend);
        for i in 1..=10u64 {
            file.apply_put(seq(i), "k", Revision::new(i), b"{}").unwrap();
        }
        file.apply_put(seq(11), "other", Revision::new(11), b"{}")
            .unwrap();
        file.apply_remove(seq(12), "other", Revision::new(11))
            .unwrap();
        assert!(file.dead_ratio() > 0.5);

        let target = InMemoryBackend::new();
        file.rewrite(Box::new(target.clone())).unwrap();
        assert_eq!(file.live_count(), 1);
        assert_eq!(file.applied_seq(), seq(12));

        let reopened = open(&target);
        assert_eq!(reopened.applied_seq(), seq(12));
        assert_eq!(reopened.revision("k"), Some(Revision::new(10)));
        assert_eq!(reopened.stats().records, 2);
    }
}
