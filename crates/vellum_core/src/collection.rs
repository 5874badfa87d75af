//! In-memory state of one open collection.
//!
//! Committed documents live in two places: the overlay holds everything
//! committed but not yet collected, the datafile holds the rest. A read
//! consults the overlay first. Both are read under the `data` read lock, so
//! a concurrent eviction can never hide a document between the two lookups.

use crate::config::CollectionOptions;
use crate::datafile::Datafile;
use crate::document::Document;
use crate::error::CoreResult;
use crate::index::IndexSet;
use crate::transaction::CollectionLock;
use crate::types::{CollectionId, DatabaseId, Revision, SequenceNumber};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A committed change not yet moved into the datafile.
#[derive(Debug, Clone)]
pub(crate) struct OverlayEntry {
    /// WAL sequence of the change; 0 for unlogged changes.
    pub(crate) seq: SequenceNumber,
    /// The document, or `None` for a removal.
    pub(crate) doc: Option<Document>,
    /// False for changes the WAL never saw; those are never evicted.
    pub(crate) logged: bool,
}

#[derive(Debug, Default)]
pub(crate) struct CollectionData {
    pub(crate) overlay: BTreeMap<String, OverlayEntry>,
    pub(crate) indexes: IndexSet,
}

impl CollectionData {
    pub(crate) fn evict(&mut self, collected: SequenceNumber) -> usize {
        let before = self.overlay.len();
        self.overlay
            .retain(|_, entry| !entry.logged || entry.seq > collected);
        before - self.overlay.len()
    }
}

pub(crate) struct CollectionState {
    pub(crate) id: CollectionId,
    pub(crate) database: DatabaseId,
    pub(crate) name: String,
    pub(crate) globally_unique_id: Uuid,
    pub(crate) options: CollectionOptions,
    pub(crate) data: RwLock<CollectionData>,
    pub(crate) datafile: Mutex<Datafile>,
    /// Live documents as seen by readers.
    pub(crate) count: AtomicU64,
    /// Live documents as of the last collected sequence.
    pub(crate) collected_count: AtomicU64,
    pub(crate) lock: Arc<CollectionLock>,
    pub(crate) dropped: AtomicBool,
}

impl CollectionState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: CollectionId,
        database: DatabaseId,
        name: String,
        globally_unique_id: Uuid,
        options: CollectionOptions,
        datafile: Datafile,
        count: u64,
    ) -> Self {
        Self {
            id,
            database,
            name,
            globally_unique_id,
            options,
            data: RwLock::new(CollectionData::default()),
            datafile: Mutex::new(datafile),
            count: AtomicU64::new(count),
            collected_count: AtomicU64::new(count),
            lock: Arc::new(CollectionLock::new()),
            dropped: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn apply_delta(count: u64, delta: i64) -> u64 {
        if delta >= 0 {
            count.saturating_add(delta.unsigned_abs())
        } else {
            count.saturating_sub(delta.unsigned_abs())
        }
    }

    pub(crate) fn adjust_count(counter: &AtomicU64, delta: i64) {
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(Self::apply_delta(n, delta))
        });
    }

    /// Looks up a committed document while the caller holds `data`.
    pub(crate) fn lookup(data: &CollectionData, datafile: &Datafile, key: &str) -> CoreResult<Option<Document>> {
        match data.overlay.get(key) {
            Some(entry) => Ok(entry.doc.clone()),
            None => datafile.get(key),
        }
    }

    /// Reads the committed version of a document.
    pub(crate) fn read(&self, key: &str) -> CoreResult<Option<Document>> {
        let data = self.data.read();
        let datafile = self.datafile.lock();
        Self::lookup(&data, &datafile, key)
    }

    /// Reads the committed revision of a document.
    pub(crate) fn revision(&self, key: &str) -> Option<Revision> {
        let data = self.data.read();
        match data.overlay.get(key) {
            Some(entry) => entry.doc.as_ref().map(|doc| doc.rev),
            None => self.datafile.lock().revision(key),
        }
    }

    /// All committed `(key, revision)` pairs, sorted by key.
    pub(crate) fn key_revisions(&self) -> Vec<(String, Revision)> {
        let data = self.data.read();
        let datafile = self.datafile.lock();
        let mut merged: BTreeMap<String, Option<Revision>> = datafile
            .revisions()
            .map(|(key, rev)| (key.to_string(), Some(rev)))
            .collect();
        for (key, entry) in &data.overlay {
            merged.insert(key.clone(), entry.doc.as_ref().map(|doc| doc.rev));
        }
        merged
            .into_iter()
            .filter_map(|(key, rev)| rev.map(|rev| (key, rev)))
            .collect()
    }

    /// All committed documents, sorted by key.
    pub(crate) fn scan(&self) -> CoreResult<Vec<Document>> {
        let data = self.data.read();
        let datafile = self.datafile.lock();
        Self::scan_locked(&data, &datafile)
    }

    pub(crate) fn scan_locked(data: &CollectionData, datafile: &Datafile) -> CoreResult<Vec<Document>> {
        let mut merged: BTreeMap<String, Option<Document>> = BTreeMap::new();
        for (key, entry) in &data.overlay {
            merged.insert(key.clone(), entry.doc.clone());
        }
        let stored: Vec<String> = datafile
            .revisions()
            .map(|(key, _)| key.to_string())
            .filter(|key| !merged.contains_key(key))
            .collect();
        for key in stored {
            let doc = datafile.get(&key)?;
            merged.insert(key, doc);
        }
        Ok(merged.into_values().flatten().collect())
    }

    /// Counts live documents by looking at them.
    pub(crate) fn count_locked(data: &CollectionData, datafile: &Datafile) -> u64 {
        let mut count = datafile.live_count();
        for (key, entry) in &data.overlay {
            match (datafile.contains(key), entry.doc.is_some()) {
                (false, true) => count += 1,
                (true, false) => count = count.saturating_sub(1),
                _ => {}
            }
        }
        count
    }
}

impl fmt::Debug for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionState")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("name", &self.name)
            .field("count", &self.count())
            .field("dropped", &self.is_dropped())
            .finish_non_exhaustive()
    }
}
