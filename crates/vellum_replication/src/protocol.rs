//! Replication wire messages and their CBOR encoding.
//!
//! Every request is a read against the leader, so a follower may resend
//! any of them after a lost response.
//!
//! Two comparison formats exist. The "old" keys format splits the leader's
//! sorted keys into chunks, each carrying a hash over its entries; the
//! follower lists a chunk key by key only when its own hash for the same
//! key range differs. The "new" revisions format groups entries into
//! buckets by revision and hashes each bucket; mismatching buckets are
//! listed revision by revision.

use crate::error::{ReplicationError, ReplicationResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vellum_core::{Document, Revision};

/// Wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// One document version as the comparison formats see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Document key.
    pub key: String,
    /// Document revision.
    pub rev: u64,
    /// SHA-256 of the body.
    pub body_hash: [u8; 32],
}

impl Entry {
    /// Builds the entry for a stored document.
    pub fn of(doc: &Document) -> Self {
        Self {
            key: doc.key.clone(),
            rev: doc.rev.as_u64(),
            body_hash: doc.body_hash(),
        }
    }

    /// Hash over key, revision and body hash.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.rev.to_be_bytes());
        hasher.update(self.body_hash);
        hasher.finalize().into()
    }
}

/// A contiguous range of the leader's sorted keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChunk {
    /// Smallest key in the chunk.
    pub low: String,
    /// Largest key in the chunk.
    pub high: String,
    /// Number of entries.
    pub count: u64,
    /// Hash over the entries in key order.
    pub hash: [u8; 32],
}

/// Hash over entries already sorted by key.
pub fn chunk_hash<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.digest());
    }
    hasher.finalize().into()
}

/// Splits entries sorted by key into chunks of `chunk_size`.
pub fn key_chunks(entries: &[Entry], chunk_size: u64) -> Vec<KeyChunk> {
    let size = usize::try_from(chunk_size.max(1)).unwrap_or(usize::MAX);
    entries
        .chunks(size)
        .filter_map(|chunk| {
            let (first, last) = (chunk.first()?, chunk.last()?);
            Some(KeyChunk {
                low: first.key.clone(),
                high: last.key.clone(),
                count: chunk.len() as u64,
                hash: chunk_hash(chunk),
            })
        })
        .collect()
}

/// Summary of one revision bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionBucket {
    /// Bucket index.
    pub index: u32,
    /// Number of entries.
    pub count: u64,
    /// XOR of the entry digests, so insertion order does not matter.
    pub hash: [u8; 32],
}

/// Bucket a revision falls into.
pub fn bucket_of(rev: u64, bucket_count: u32) -> u32 {
    let count = u64::from(bucket_count.max(1));
    // The remainder is below `count`, which came from a u32.
    u32::try_from(rev % count).unwrap_or(0)
}

/// Computes every bucket summary, empty buckets included.
pub fn revision_buckets<'a>(
    entries: impl IntoIterator<Item = &'a Entry>,
    bucket_count: u32,
) -> Vec<RevisionBucket> {
    let mut buckets: Vec<RevisionBucket> = (0..bucket_count.max(1))
        .map(|index| RevisionBucket {
            index,
            count: 0,
            hash: [0u8; 32],
        })
        .collect();
    for entry in entries {
        let slot = bucket_of(entry.rev, bucket_count) as usize;
        if let Some(bucket) = buckets.get_mut(slot) {
            bucket.count += 1;
            for (acc, byte) in bucket.hash.iter_mut().zip(entry.digest()) {
                *acc ^= byte;
            }
        }
    }
    buckets
}

/// A document in transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDocument {
    /// Document key.
    pub key: String,
    /// Document revision.
    pub rev: u64,
    /// JSON body.
    pub body: Vec<u8>,
}

impl WireDocument {
    /// Encodes a stored document.
    ///
    /// # Errors
    ///
    /// Returns a core codec error if the body cannot be serialized.
    pub fn from_document(doc: &Document) -> ReplicationResult<Self> {
        Ok(Self {
            key: doc.key.clone(),
            rev: doc.rev.as_u64(),
            body: doc.body_bytes()?,
        })
    }

    /// Decodes back into a document.
    ///
    /// # Errors
    ///
    /// Returns a core codec error if the body is not a JSON object.
    pub fn into_document(self) -> ReplicationResult<Document> {
        Ok(Document::from_body_bytes(
            self.key,
            Revision::new(self.rev),
            &self.body,
        )?)
    }

    /// Body hash of the carried document.
    ///
    /// # Errors
    ///
    /// Fails if the body is not a JSON object.
    pub fn body_hash(&self) -> ReplicationResult<[u8; 32]> {
        let doc = Document::from_body_bytes(self.key.as_str(), Revision::new(self.rev), &self.body)?;
        Ok(doc.body_hash())
    }
}

/// A request from follower to leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplicationRequest {
    /// Count and largest revision of a collection.
    Inventory {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
    },
    /// Key chunk summaries ("old" format).
    KeyChunks {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
        /// Keys per chunk.
        chunk_size: u64,
    },
    /// Entries with `low <= key <= high`.
    KeysInRange {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
        /// Inclusive lower bound.
        low: String,
        /// Inclusive upper bound.
        high: String,
    },
    /// Revision bucket summaries ("new" format).
    RevisionTree {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
        /// Number of buckets.
        bucket_count: u32,
    },
    /// Entries falling into the given buckets.
    RevisionsInBuckets {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
        /// Number of buckets.
        bucket_count: u32,
        /// Bucket indexes to list.
        buckets: Vec<u32>,
    },
    /// Full documents by key.
    Documents {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
        /// Keys to fetch; missing keys are skipped.
        keys: Vec<String>,
    },
    /// A page of the collection in key order.
    Dump {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
        /// Start after this key.
        after: Option<String>,
        /// Page size.
        limit: u64,
    },
}

impl ReplicationRequest {
    /// Request name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Inventory { .. } => "inventory",
            Self::KeyChunks { .. } => "keyChunks",
            Self::KeysInRange { .. } => "keysInRange",
            Self::RevisionTree { .. } => "revisionTree",
            Self::RevisionsInBuckets { .. } => "revisionsInBuckets",
            Self::Documents { .. } => "documents",
            Self::Dump { .. } => "dump",
        }
    }

    /// Target database and collection.
    pub fn target(&self) -> (&str, &str) {
        match self {
            Self::Inventory {
                database,
                collection,
            }
            | Self::KeyChunks {
                database,
                collection,
                ..
            }
            | Self::KeysInRange {
                database,
                collection,
                ..
            }
            | Self::RevisionTree {
                database,
                collection,
                ..
            }
            | Self::RevisionsInBuckets {
                database,
                collection,
                ..
            }
            | Self::Documents {
                database,
                collection,
                ..
            }
            | Self::Dump {
                database,
                collection,
                ..
            } => (database, collection),
        }
    }
}

/// A leader's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplicationResponse {
    /// Answer to [`ReplicationRequest::Inventory`].
    Inventory {
        /// Live documents.
        count: u64,
        /// Largest revision present, 0 when empty.
        max_rev: u64,
    },
    /// Answer to [`ReplicationRequest::KeyChunks`].
    KeyChunks {
        /// Chunks in key order.
        chunks: Vec<KeyChunk>,
    },
    /// Answer to the listing requests.
    Entries {
        /// Entries in key order.
        entries: Vec<Entry>,
    },
    /// Answer to [`ReplicationRequest::RevisionTree`].
    RevisionTree {
        /// One summary per bucket.
        buckets: Vec<RevisionBucket>,
    },
    /// Answer to [`ReplicationRequest::Documents`].
    Documents {
        /// Documents found.
        documents: Vec<WireDocument>,
    },
    /// Answer to [`ReplicationRequest::Dump`].
    Dump {
        /// Documents in key order.
        documents: Vec<WireDocument>,
        /// Whether more pages follow.
        has_more: bool,
    },
    /// The leader does not know this request.
    NotImplemented {
        /// Request name.
        request: String,
    },
    /// The leader failed to answer.
    Error {
        /// HTTP-style status.
        status: u16,
        /// Message.
        message: String,
    },
}

impl ReplicationResponse {
    /// Turns `NotImplemented` and `Error` answers into errors.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::NotImplemented`] or
    /// [`ReplicationError::Leader`].
    pub fn into_result(self) -> ReplicationResult<Self> {
        match self {
            Self::NotImplemented { request } => Err(ReplicationError::NotImplemented { request }),
            Self::Error { status, message } => Err(ReplicationError::Leader { status, message }),
            other => Ok(other),
        }
    }
}

/// Encodes a value as CBOR.
pub trait CborEncode {
    /// Encodes to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Codec`] on failure.
    fn encode_cbor(&self) -> ReplicationResult<Vec<u8>>;
}

/// Decodes a value from CBOR.
pub trait CborDecode: Sized {
    /// Decodes from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Codec`] on failure.
    fn decode_cbor(bytes: &[u8]) -> ReplicationResult<Self>;
}

impl<T: Serialize> CborEncode for T {
    fn encode_cbor(&self) -> ReplicationResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out).map_err(|e| ReplicationError::Codec(e.to_string()))?;
        Ok(out)
    }
}

impl<T: serde::de::DeserializeOwned> CborDecode for T {
    fn decode_cbor(bytes: &[u8]) -> ReplicationResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ReplicationError::Codec(e.to_string()))
    }
}
