//! WAL entry types and their encoding.

use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, DatabaseId, Revision, SequenceNumber, TransactionId};

/// Magic bytes opening every WAL entry.
pub const WAL_MAGIC: [u8; 4] = *b"VWAL";

/// Current WAL format version.
pub const WAL_VERSION: u8 = 1;

/// magic (4) + version (1) + kind (1) + sequence (8) + length (4)
pub(crate) const HEADER_FIELDS_SIZE: usize = 18;

/// Header fields followed by their own crc32, so a damaged length is caught
/// before it is trusted.
pub(crate) const HEADER_SIZE: usize = HEADER_FIELDS_SIZE + CRC_SIZE;

pub(crate) const CRC_SIZE: usize = 4;

/// Kind byte of a WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WalEntryKind {
    /// Document insert.
    Insert = 1,
    /// Document update or replace, carrying the full new body.
    Update = 2,
    /// Document removal.
    Remove = 3,
    /// Makes the transaction's preceding entries durable as a unit.
    IntermediateCommit = 4,
    /// Makes the transaction's remaining entries durable and ends it.
    Commit = 5,
    /// Ends a transaction without committing its unmarked entries.
    Abort = 6,
    /// Written after a fully collected log was truncated.
    Checkpoint = 7,
    /// Written by a clean shutdown.
    Shutdown = 8,
}

impl WalEntryKind {
    /// Converts a byte to a kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            3 => Some(Self::Remove),
            4 => Some(Self::IntermediateCommit),
            5 => Some(Self::Commit),
            6 => Some(Self::Abort),
            7 => Some(Self::Checkpoint),
            8 => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns the lowercase name used by tooling.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::IntermediateCommit => "intermediate-commit",
            Self::Commit => "commit",
            Self::Abort => "abort",
            Self::Checkpoint => "checkpoint",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A document mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentOp {
    /// The key must not exist.
    Insert,
    /// The key must exist; the body replaces it.
    Update,
    /// The key must exist; it is removed.
    Remove,
}

impl DocumentOp {
    const fn kind(self) -> WalEntryKind {
        match self {
            Self::Insert => WalEntryKind::Insert,
            Self::Update => WalEntryKind::Update,
            Self::Remove => WalEntryKind::Remove,
        }
    }
}

/// A logged document mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Owning transaction.
    pub txid: TransactionId,
    /// Database of the collection.
    pub database: DatabaseId,
    /// Target collection, resolved by id during replay.
    pub collection: CollectionId,
    /// What happened.
    pub op: DocumentOp,
    /// Document key.
    pub key: String,
    /// Revision written (removed revision for removes).
    pub rev: Revision,
    /// Encoded body; empty for removes.
    pub body: Vec<u8>,
}

/// A WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Insert, update or remove of one document.
    Document(DocumentChange),
    /// Intermediate commit marker.
    IntermediateCommit {
        /// Transaction id.
        txid: TransactionId,
    },
    /// Commit marker.
    Commit {
        /// Transaction id.
        txid: TransactionId,
    },
    /// Abort marker.
    Abort {
        /// Transaction id.
        txid: TransactionId,
    },
    /// Checkpoint after truncation.
    Checkpoint {
        /// Collected watermark at truncation time.
        collected: SequenceNumber,
    },
    /// Clean shutdown marker.
    Shutdown,
}

/// A record with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Sequence number.
    pub sequence: SequenceNumber,
    /// The record.
    pub record: WalRecord,
}

struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| CoreError::wal_corruption("unexpected end of payload"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(bytes))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn finish(self, kind: WalEntryKind) -> CoreResult<()> {
        if self.pos != self.data.len() {
            return Err(CoreError::wal_corruption(format!(
                "trailing bytes in {} entry: expected {}, got {}",
                kind.name(),
                self.pos,
                self.data.len()
            )));
        }
        Ok(())
    }
}

impl WalRecord {
    /// Returns the kind byte for this record.
    #[must_use]
    pub fn kind(&self) -> WalEntryKind {
        match self {
            Self::Document(change) => change.op.kind(),
            Self::IntermediateCommit { .. } => WalEntryKind::IntermediateCommit,
            Self::Commit { .. } => WalEntryKind::Commit,
            Self::Abort { .. } => WalEntryKind::Abort,
            Self::Checkpoint { .. } => WalEntryKind::Checkpoint,
            Self::Shutdown => WalEntryKind::Shutdown,
        }
    }

    /// Returns the transaction this record belongs to, if any.
    #[must_use]
    pub fn txid(&self) -> Option<TransactionId> {
        match self {
            Self::Document(change) => Some(change.txid),
            Self::IntermediateCommit { txid } | Self::Commit { txid } | Self::Abort { txid } => {
                Some(*txid)
            }
            Self::Checkpoint { .. } | Self::Shutdown => None,
        }
    }

    /// Serializes the payload (without envelope).
    ///
    /// ```text
    /// document: txid(8) database(8) collection(8) rev(8) key_len(2) key body_len(4) body
    /// markers:  txid(8)
    /// checkpoint: collected(8)
    /// shutdown: (empty)
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the key or body exceed their length fields.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Document(change) => {
                let key_len = u16::try_from(change.key.len())
                    .map_err(|_| CoreError::invalid_argument("document key too long"))?;
                let body_len = u32::try_from(change.body.len())
                    .map_err(|_| CoreError::invalid_argument("document body too large"))?;
                buf.reserve(38 + change.key.len() + change.body.len());
                buf.extend_from_slice(&change.txid.as_u64().to_le_bytes());
                buf.extend_from_slice(&change.database.as_u64().to_le_bytes());
                buf.extend_from_slice(&change.collection.as_u64().to_le_bytes());
                buf.extend_from_slice(&change.rev.as_u64().to_le_bytes());
                buf.extend_from_slice(&key_len.to_le_bytes());
                buf.extend_from_slice(change.key.as_bytes());
                buf.extend_from_slice(&body_len.to_le_bytes());
                buf.extend_from_slice(&change.body);
            }
            Self::IntermediateCommit { txid } | Self::Commit { txid } | Self::Abort { txid } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
            }
            Self::Checkpoint { collected } => {
                buf.extend_from_slice(&collected.as_u64().to_le_bytes());
            }
            Self::Shutdown => {}
        }
        Ok(buf)
    }

    /// Deserializes a record from its kind and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalCorruption`] for short, overlong or malformed
    /// payloads.
    pub fn decode_payload(kind: WalEntryKind, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let record = match kind {
            WalEntryKind::Insert | WalEntryKind::Update | WalEntryKind::Remove => {
                let txid = TransactionId::new(reader.u64()?);
                let database = DatabaseId::new(reader.u64()?);
                let collection = CollectionId::new(reader.u64()?);
                let rev = Revision::new(reader.u64()?);
                let key_len = usize::from(reader.u16()?);
                let key = std::str::from_utf8(reader.take(key_len)?)
                    .map_err(|_| CoreError::wal_corruption("document key is not UTF-8"))?
                    .to_string();
                let body_len = reader.u32()? as usize;
                let body = reader.take(body_len)?.to_vec();
                let op = match kind {
                    WalEntryKind::Insert => DocumentOp::Insert,
                    WalEntryKind::Update => DocumentOp::Update,
                    _ => DocumentOp::Remove,
                };
                Self::Document(DocumentChange {
                    txid,
                    database,
                    collection,
                    op,
                    key,
                    rev,
                    body,
                })
            }
            WalEntryKind::IntermediateCommit => Self::IntermediateCommit {
                txid: TransactionId::new(reader.u64()?),
            },
            WalEntryKind::Commit => Self::Commit {
                txid: TransactionId::new(reader.u64()?),
            },
            WalEntryKind::Abort => Self::Abort {
                txid: TransactionId::new(reader.u64()?),
            },
            WalEntryKind::Checkpoint => Self::Checkpoint {
                collected: SequenceNumber::new(reader.u64()?),
            },
            WalEntryKind::Shutdown => Self::Shutdown,
        };
        reader.finish(kind)?;
        Ok(record)
    }
}

/// Builds the full on-disk entry: header, header CRC, payload and CRC.
///
/// # Errors
///
/// Returns an error if the payload cannot be encoded.
pub fn encode_entry(sequence: SequenceNumber, record: &WalRecord) -> CoreResult<Vec<u8>> {
    let payload = record.encode_payload()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("WAL entry payload too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&WAL_MAGIC);
    data.push(WAL_VERSION);
    data.push(record.kind().as_byte());
    data.extend_from_slice(&sequence.as_u64().to_le_bytes());
    data.extend_from_slice(&len.to_le_bytes());
    let header_crc = crc32fast::hash(&data);
    data.extend_from_slice(&header_crc.to_le_bytes());
    data.extend_from_slice(&payload);

    let crc = crc32fast::hash(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(op: DocumentOp) -> DocumentChange {
        DocumentChange {
            txid: TransactionId::new(3),
            database: DatabaseId::new(1),
            collection: CollectionId::new(7),
            op,
            key: "alpha".into(),
            rev: Revision::new(99),
            body: br#"{"x":1}"#.to_vec(),
        }
    }

    #[test]
    fn kind_bytes_are_stable() {
        for byte in 1..=8u8 {
            let kind = WalEntryKind::from_byte(byte).unwrap();
            assert_eq!(kind.as_byte(), byte);
        }
        assert_eq!(WalEntryKind::from_byte(0), None);
        assert_eq!(WalEntryKind::from_byte(9), None);
    }

    #[test]
    fn document_payload_decodes_to_same_change() {
        for op in [DocumentOp::Insert, DocumentOp::Update, DocumentOp::Remove] {
            let record = WalRecord::Document(change(op));
            let payload = record.encode_payload().unwrap();
            let decoded = WalRecord::decode_payload(record.kind(), &payload).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn markers_carry_txid() {
        let txid = TransactionId::new(11);
        for record in [
            WalRecord::IntermediateCommit { txid },
            WalRecord::Commit { txid },
            WalRecord::Abort { txid },
        ] {
            assert_eq!(record.txid(), Some(txid));
            let payload = record.encode_payload().unwrap();
            assert_eq!(payload.len(), 8);
            assert_eq!(
                WalRecord::decode_payload(record.kind(), &payload).unwrap(),
                record
            );
        }
        assert_eq!(WalRecord::Shutdown.txid(), None);
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut payload = WalRecord::Commit {
            txid: TransactionId::new(1),
        }
        .encode_payload()
        .unwrap();
        payload.push(0);
        assert!(matches!(
            WalRecord::decode_payload(WalEntryKind::Commit, &payload),
            Err(CoreError::WalCorruption { .. })
        ));
    }

    #[test]
    fn short_document_payload_is_corruption() {
        let payload = WalRecord::Document(change(DocumentOp::Insert))
            .encode_payload()
            .unwrap();
        assert!(WalRecord::decode_payload(WalEntryKind::Insert, &payload[..20]).is_err());
    }

    #[test]
    fn entry_envelope_layout() {
        let entry = encode_entry(SequenceNumber::new(5), &WalRecord::Shutdown).unwrap();
        assert_eq!(entry.len(), HEADER_SIZE + CRC_SIZE);
        assert_eq!(&entry[0..4], b"VWAL");
        assert_eq!(entry[4], WAL_VERSION);
        assert_eq!(entry[5], WalEntryKind::Shutdown.as_byte());
        assert_eq!(u64::from_le_bytes(entry[6..14].try_into().unwrap()), 5);
    }
}
