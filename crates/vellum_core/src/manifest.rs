//! Catalog manifest.
//!
//! The manifest is the durable catalog: databases, collections, index
//! definitions, document counts as of the last collection, and the
//! collector watermark. It is rewritten atomically on every catalog change.
//!
//! ```text
//! | magic "VMAN" (4) | version (2) | length (4) | CBOR body | crc32 (4) |
//! ```

use crate::config::{CollectionOptions, DatabaseOptions};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexDefinition;
use crate::types::{CollectionId, DatabaseId, IndexId, Revision, SequenceNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"VMAN";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10;

/// A collection entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    /// Internal id.
    pub id: CollectionId,
    /// Name, unique among live collections of the database.
    pub name: String,
    /// Globally unique id.
    pub globally_unique_id: Uuid,
    /// Creation options.
    pub options: CollectionOptions,
    /// Document count as of the last collector pass.
    pub count: u64,
    /// Dropped and awaiting reclamation.
    pub dropped: bool,
    /// Secondary index definitions.
    pub indexes: Vec<IndexDefinition>,
}

/// A database entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMeta {
    /// Internal id.
    pub id: DatabaseId,
    /// Name.
    pub name: String,
    /// Creation options.
    pub options: DatabaseOptions,
    /// Dropped and awaiting reclamation.
    pub dropped: bool,
    /// Collections, live and dropped.
    pub collections: BTreeMap<CollectionId, CollectionMeta>,
}

impl DatabaseMeta {
    /// Finds a live collection by name.
    #[must_use]
    pub fn live_collection(&self, name: &str) -> Option<&CollectionMeta> {
        self.collections
            .values()
            .find(|c| !c.dropped && c.name == name)
    }

    /// Returns live collections in id order.
    pub fn live_collections(&self) -> impl Iterator<Item = &CollectionMeta> {
        self.collections.values().filter(|c| !c.dropped)
    }
}

/// The durable catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Identity of this data directory.
    pub server_id: Uuid,
    /// Next database id to hand out.
    pub next_database_id: u64,
    /// Next collection id to hand out.
    pub next_collection_id: u64,
    /// Next index id to hand out.
    pub next_index_id: u64,
    /// Every entry up to here is in the datafiles.
    pub collected_seq: SequenceNumber,
    /// Highest sequence assigned when the WAL was last emptied.
    pub last_seq: SequenceNumber,
    /// Highest revision issued when the manifest was written.
    pub max_revision: Revision,
    /// The previous process shut down cleanly.
    pub clean_shutdown: bool,
    /// Databases, live and dropped.
    pub databases: BTreeMap<DatabaseId, DatabaseMeta>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// Creates an empty manifest with a fresh server id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            server_id: Uuid::new_v4(),
            next_database_id: 1,
            next_collection_id: 1,
            next_index_id: 1,
            collected_seq: SequenceNumber::default(),
            last_seq: SequenceNumber::default(),
            max_revision: Revision::default(),
            clean_shutdown: false,
            databases: BTreeMap::new(),
        }
    }

    /// Finds a database by name, live or awaiting reclamation.
    #[must_use]
    pub fn database_by_name(&self, name: &str) -> Option<&DatabaseMeta> {
        self.databases.values().find(|db| db.name == name)
    }

    /// Finds a live database by name.
    #[must_use]
    pub fn live_database(&self, name: &str) -> Option<&DatabaseMeta> {
        self.databases
            .values()
            .find(|db| !db.dropped && db.name == name)
    }

    /// Databases holding a slot: live ones and dropped ones not yet reclaimed.
    #[must_use]
    pub fn database_slots(&self) -> usize {
        self.databases.len()
    }

    /// Finds a collection by id.
    #[must_use]
    pub fn collection(&self, id: CollectionId) -> Option<(&DatabaseMeta, &CollectionMeta)> {
        self.databases
            .values()
            .find_map(|db| db.collections.get(&id).map(|c| (db, c)))
    }

    /// Finds a collection by id, mutably.
    pub fn collection_mut(&mut self, id: CollectionId) -> Option<&mut CollectionMeta> {
        self.databases
            .values_mut()
            .find_map(|db| db.collections.get_mut(&id))
    }

    /// Hands out a database id.
    pub fn allocate_database_id(&mut self) -> DatabaseId {
        let id = DatabaseId::new(self.next_database_id);
        self.next_database_id += 1;
        id
    }

    /// Hands out a collection id.
    pub fn allocate_collection_id(&mut self) -> CollectionId {
        let id = CollectionId::new(self.next_collection_id);
        self.next_collection_id += 1;
        id
    }

    /// Hands out an index id.
    pub fn allocate_index_id(&mut self) -> IndexId {
        let id = IndexId::new(self.next_index_id);
        self.next_index_id += 1;
        id
    }

    /// Encodes the manifest with its envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if CBOR encoding fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body).map_err(|e| CoreError::codec(e.to_string()))?;
        let len = u32::try_from(body.len())
            .map_err(|_| CoreError::invalid_operation("manifest too large"))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len() + 4);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&body);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a manifest.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for a bad envelope,
    /// [`CoreError::ChecksumMismatch`] for damaged bytes and
    /// [`CoreError::Codec`] for an undecodable body.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < HEADER_SIZE + 4 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version {version}"
            )));
        }
        let len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        if data.len() != HEADER_SIZE + len + 4 {
            return Err(CoreError::invalid_format("manifest length mismatch"));
        }
        let body_end = HEADER_SIZE + len;
        let expected = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        let actual = crc32fast::hash(&data[..body_end]);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
        ciborium::from_reader(&data[HEADER_SIZE..body_end])
            .map_err(|e| CoreError::codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new();
        let db = manifest.allocate_database_id();
        let col = manifest.allocate_collection_id();
        let mut collections = BTreeMap::new();
        collections.insert(
            col,
            CollectionMeta {
                id: col,
                name: "users".into(),
                globally_unique_id: Uuid::new_v4(),
                options: CollectionOptions::default(),
                count: 3,
                dropped: false,
                indexes: Vec::new(),
            },
        );
        manifest.databases.insert(
            db,
            DatabaseMeta {
                id: db,
                name: "shop".into(),
                options: DatabaseOptions::default(),
                dropped: false,
                collections,
            },
        );
        manifest.collected_seq = SequenceNumber::new(42);
        manifest
    }

    #[test]
    fn encoded_manifest_decodes_identically() {
        let manifest = sample();
        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn lookups_skip_dropped_entries() {
        let mut manifest = sample();
        assert!(manifest.live_database("shop").is_some());
        let db = manifest.databases.values_mut().next().unwrap();
        db.dropped = true;
        assert!(manifest.live_database("shop").is_none());
        assert!(manifest.database_by_name("shop").is_some());
        assert_eq!(manifest.database_slots(), 1);
    }

    #[test]
    fn collection_by_id() {
        let mut manifest = sample();
        let id = CollectionId::new(1);
        assert_eq!(manifest.collection(id).unwrap().1.name, "users");
        manifest.collection_mut(id).unwrap().count = 9;
        assert_eq!(manifest.collection(id).unwrap().1.count, 9);
        assert!(manifest.collection(CollectionId::new(99)).is_none());
    }

    #[test]
    fn ids_are_never_reused() {
        let mut manifest = Manifest::new();
        let a = manifest.allocate_collection_id();
        let b = manifest.allocate_collection_id();
        assert!(b > a);
    }

    #[test]
    fn damaged_manifest_is_rejected() {
        let mut bytes = sample().encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            Manifest::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
        assert!(Manifest::decode(b"nope").is_err());
    }
}
