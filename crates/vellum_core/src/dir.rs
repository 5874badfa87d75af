//! Data directory layout.
//!
//! ```text
//! <root>/
//! ├─ MANIFEST                          # catalog (atomic rewrite)
//! ├─ LOCK                              # advisory lock, file system only
//! ├─ wal.log                           # write-ahead log
//! └─ databases/
//!    ├─ database-<id>/
//!    │  ├─ collection-<id>.dat         # datafile
//!    │  └─ collection-<id>.compact     # compaction in progress
//!    └─ tmp-database-<id>/             # creation in progress
//! ```
//!
//! Databases and collections are created under a `tmp-` name and renamed
//! into place; the manifest is only updated after the rename. Anything
//! under a `tmp-` name, or not referenced by the manifest, is an orphan of
//! an interrupted operation and is removed on open.

use crate::datafile::Datafile;
use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use crate::types::{CollectionId, DatabaseId};
#[cfg(feature = "std")]
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fmt;
#[cfg(feature = "std")]
use std::fs::{File, OpenOptions};
#[cfg(feature = "std")]
use std::path::Path;
use std::sync::Arc;
use vellum_storage::fault::{points, FaultController};
#[cfg(feature = "std")]
use vellum_storage::FsVolume;
use vellum_storage::{StorageBackend, StorageError, Volume};

const MANIFEST_FILE: &str = "MANIFEST";
#[cfg(feature = "std")]
const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const DATABASES_DIR: &str = "databases";
const TEMP_PREFIX: &str = "tmp-";

/// A data directory on some [`Volume`].
pub struct DataDir {
    volume: Arc<dyn Volume>,
    faults: Arc<dyn FaultController>,
    #[cfg(feature = "std")]
    _lock: Option<File>,
}

impl DataDir {
    /// Opens a directory of the OS file system and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseLocked`] if another process holds the
    /// lock, and [`CoreError::InvalidOperation`] if the directory is missing
    /// and `create_if_missing` is false.
    #[cfg(feature = "std")]
    pub fn open_path(
        path: &Path,
        create_if_missing: bool,
        faults: Arc<dyn FaultController>,
    ) -> CoreResult<Self> {
        if !path.exists() && !create_if_missing {
            return Err(CoreError::invalid_operation(format!(
                "data directory does not exist: {}",
                path.display()
            )));
        }
        let volume = FsVolume::new(path)?;
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            volume: Arc::new(volume),
            faults,
            _lock: Some(lock),
        })
    }

    /// Uses an arbitrary volume. No lock is taken.
    #[must_use]
    pub fn with_volume(volume: Arc<dyn Volume>, faults: Arc<dyn FaultController>) -> Self {
        Self {
            volume,
            faults,
            #[cfg(feature = "std")]
            _lock: None,
        }
    }

    /// Returns the underlying volume.
    #[must_use]
    pub fn volume(&self) -> &Arc<dyn Volume> {
        &self.volume
    }

    /// Volume name of a database directory.
    #[must_use]
    pub fn database_dir(id: DatabaseId) -> String {
        format!("{DATABASES_DIR}/database-{}", id.as_u64())
    }

    /// Volume name of a collection datafile.
    #[must_use]
    pub fn collection_file(database: DatabaseId, collection: CollectionId) -> String {
        format!(
            "{}/collection-{}.dat",
            Self::database_dir(database),
            collection.as_u64()
        )
    }

    fn compact_file(database: DatabaseId, collection: CollectionId) -> String {
        format!(
            "{}/collection-{}.compact",
            Self::database_dir(database),
            collection.as_u64()
        )
    }

    /// Returns true if a manifest exists.
    #[must_use]
    pub fn has_manifest(&self) -> bool {
        self.volume.exists(MANIFEST_FILE)
    }

    /// Loads the manifest, or `None` for an empty directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be decoded.
    pub fn load_manifest(&self) -> CoreResult<Option<Manifest>> {
        match self.volume.read_file(MANIFEST_FILE)? {
            Some(bytes) => Ok(Some(Manifest::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Atomically replaces the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        self.volume.write_atomic(MANIFEST_FILE, &manifest.encode()?)?;
        Ok(())
    }

    /// Opens the WAL file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open_wal(&self) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(self.volume.open(WAL_FILE)?)
    }

    /// Creates the directory of a new database through a temporary name.
    ///
    /// # Errors
    ///
    /// Fails if either fail point fires or the volume rejects a step; the
    /// temporary directory is removed on failure.
    pub fn create_database_dir(&self, id: DatabaseId) -> CoreResult<()> {
        let temp = format!("{DATABASES_DIR}/{TEMP_PREFIX}database-{}", id.as_u64());
        self.faults.check(points::CREATE_DATABASE_TEMP_DIRECTORY)?;
        self.volume.create_dir(&temp)?;

        let renamed = self
            .faults
            .check(points::CREATE_DATABASE_RENAME_DIRECTORY)
            .map_err(CoreError::from)
            .and_then(|()| Ok(self.volume.rename(&temp, &Self::database_dir(id))?));
        if let Err(err) = renamed {
            let _ = self.volume.remove(&temp);
            return Err(err);
        }
        Ok(())
    }

    /// Creates the empty datafile of a new collection through a temporary
    /// name.
    ///
    /// # Errors
    ///
    /// Fails if either fail point fires or the volume rejects a step; the
    /// temporary file is removed on failure.
    pub fn create_collection_file(
        &self,
        database: DatabaseId,
        collection: CollectionId,
    ) -> CoreResult<()> {
        let temp = format!(
            "{}/{TEMP_PREFIX}collection-{}.dat",
            Self::database_dir(database),
            collection.as_u64()
        );
        self.faults.check(points::CREATE_COLLECTION_TEMP_DIRECTORY)?;
        let mut file = self.volume.open(&temp)?;
        file.sync()?;
        drop(file);

        let renamed = self
            .faults
            .check(points::CREATE_COLLECTION_RENAME_DIRECTORY)
            .map_err(CoreError::from)
            .and_then(|()| {
                Ok(self
                    .volume
                    .rename(&temp, &Self::collection_file(database, collection))?)
            });
        if let Err(err) = renamed {
            let _ = self.volume.remove(&temp);
            return Err(err);
        }
        Ok(())
    }

    /// Opens a collection datafile, finishing or discarding an interrupted
    /// compaction first.
    ///
    /// # Errors
    ///
    /// Returns an error if the datafile is damaged or cannot be opened.
    pub fn open_datafile(
        &self,
        database: DatabaseId,
        collection: CollectionId,
    ) -> CoreResult<Datafile> {
        let data = Self::collection_file(database, collection);
        let compact = Self::compact_file(database, collection);
        if self.volume.exists(&compact) {
            if self.volume.exists(&data) {
                self.volume.remove(&compact)?;
            } else {
                self.volume.rename(&compact, &data)?;
            }
        }
        Datafile::open(self.volume.open(&data)?)
    }

    /// Compacts a datafile in place.
    ///
    /// # Errors
    ///
    /// Returns an error if rewriting or swapping the files fails.
    pub fn compact_datafile(
        &self,
        database: DatabaseId,
        collection: CollectionId,
        datafile: &mut Datafile,
    ) -> CoreResult<()> {
        let data = Self::collection_file(database, collection);
        let compact = Self::compact_file(database, collection);
        datafile.rewrite(self.volume.open(&compact)?)?;
        self.volume.remove(&data)?;
        self.volume.rename(&compact, &data)?;
        Ok(())
    }

    /// Removes a database directory. A missing directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    pub fn remove_database_dir(&self, id: DatabaseId) -> CoreResult<()> {
        ignore_missing(self.volume.remove(&Self::database_dir(id)))
    }

    /// Removes a collection datafile. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    pub fn remove_collection_file(
        &self,
        database: DatabaseId,
        collection: CollectionId,
    ) -> CoreResult<()> {
        ignore_missing(
            self.volume
                .remove(&Self::collection_file(database, collection)),
        )?;
        ignore_missing(self.volume.remove(&Self::compact_file(database, collection)))
    }

    /// Removes leftovers of interrupted operations: temporary entries and
    /// databases or datafiles the manifest does not reference. Returns how
    /// many entries were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or removal fails.
    pub fn sweep_orphans(&self, manifest: &Manifest) -> CoreResult<usize> {
        let databases: BTreeSet<String> = manifest
            .databases
            .keys()
            .map(|id| format!("database-{}", id.as_u64()))
            .collect();
        let mut removed = 0;

        for entry in self.volume.list(DATABASES_DIR)? {
            let name = format!("{DATABASES_DIR}/{entry}");
            if entry.starts_with(TEMP_PREFIX) || !databases.contains(&entry) {
                self.volume.remove(&name)?;
                removed += 1;
            }
        }

        for db in manifest.databases.values() {
            let dir = Self::database_dir(db.id);
            let files: BTreeSet<String> = db
                .collections
                .keys()
                .flat_map(|id| {
                    [
                        format!("collection-{}.dat", id.as_u64()),
                        format!("collection-{}.compact", id.as_u64()),
                    ]
                })
                .collect();
            for entry in self.volume.list(&dir)? {
                if entry.starts_with(TEMP_PREFIX) || !files.contains(&entry) {
                    self.volume.remove(&format!("{dir}/{entry}"))?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "removed orphaned catalog files");
        }
        Ok(removed)
    }
}

fn ignore_missing(result: Result<(), StorageError>) -> CoreResult<()> {
    match result {
        Ok(()) | Err(StorageError::NotFound { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl fmt::Debug for DataDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataDir")
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::DatabaseMeta;
    use crate::types::{Revision, SequenceNumber};
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use vellum_storage::{FailPoints, MemoryVolume, NoFaults};

    fn memory_dir(faults: Arc<dyn FaultController>) -> (DataDir, MemoryVolume) {
        let volume = MemoryVolume::new();
        (DataDir::with_volume(Arc::new(volume.clone()), faults), volume)
    }

    #[test]
    fn second_open_of_same_path_is_locked() {
        let tmp = tempdir().unwrap();
        let _first = DataDir::open_path(tmp.path(), true, Arc::new(NoFaults)).unwrap();
        assert!(matches!(
            DataDir::open_path(tmp.path(), true, Arc::new(NoFaults)),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn missing_path_without_create_fails() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("absent");
        assert!(DataDir::open_path(&path, false, Arc::new(NoFaults)).is_err());
    }

    #[test]
    fn manifest_round_trips_through_volume() {
        let (dir, _) = memory_dir(Arc::new(NoFaults));
        assert!(dir.load_manifest().unwrap().is_none());
        let manifest = Manifest::new();
        dir.save_manifest(&manifest).unwrap();
        assert!(dir.has_manifest());
        assert_eq!(dir.load_manifest().unwrap().unwrap(), manifest);
    }

    #[test]
    fn database_creation_faults_leave_nothing_behind() {
        let faults = Arc::new(FailPoints::new());
        let (dir, volume) = memory_dir(faults.clone());
        let id = DatabaseId::new(1);

        for point in [
            points::CREATE_DATABASE_TEMP_DIRECTORY,
            points::CREATE_DATABASE_RENAME_DIRECTORY,
        ] {
            faults.set_fail_at(point);
            assert!(dir.create_database_dir(id).is_err());
            assert!(volume.list("databases").unwrap().is_empty());
            faults.clear_fail_at(point);
        }

        dir.create_database_dir(id).unwrap();
        assert!(volume.exists("databases/database-1"));
    }

    #[test]
    fn collection_creation_faults_leave_nothing_behind() {
        let faults = Arc::new(FailPoints::new());
        let (dir, volume) = memory_dir(faults.clone());
        let db = DatabaseId::new(1);
        let col = CollectionId::new(4);
        dir.create_database_dir(db).unwrap();

        faults.set_fail_at(points::CREATE_COLLECTION_RENAME_DIRECTORY);
        assert!(dir.create_collection_file(db, col).is_err());
        assert!(volume.list("databases/database-1").unwrap().is_empty());
        faults.clear_all();

        dir.create_collection_file(db, col).unwrap();
        assert!(volume.exists("databases/database-1/collection-4.dat"));
    }

    #[test]
    fn compaction_swaps_files_and_keeps_documents() {
        let (dir, volume) = memory_dir(Arc::new(NoFaults));
        let db = DatabaseId::new(1);
        let col = CollectionId::new(2);
        dir.create_database_dir(db).unwrap();
        dir.create_collection_file(db, col).unwrap();

        let mut datafile = dir.open_datafile(db, col).unwrap();
        for seq in 1..=10u64 {
            datafile
                .apply_put(SequenceNumber::new(seq), "k", Revision::new(seq), b"{}")
                .unwrap();
        }
        datafile.sync().unwrap();
        dir.compact_datafile(db, col, &mut datafile).unwrap();
        assert!(!volume.exists("databases/database-1/collection-2.compact"));

        let reopened = dir.open_datafile(db, col).unwrap();
        assert_eq!(reopened.live_count(), 1);
        assert_eq!(reopened.revision("k"), Some(Revision::new(10)));
        assert_eq!(reopened.applied_seq(), SequenceNumber::new(10));
    }

    #[test]
    fn interrupted_compaction_is_resolved_on_open() {
        let (dir, volume) = memory_dir(Arc::new(NoFaults));
        let db = DatabaseId::new(1);
        let col = CollectionId::new(2);
        volume
            .write_atomic("databases/database-1/collection-2.compact", b"")
            .unwrap();
        dir.open_datafile(db, col).unwrap();
        assert!(volume.exists("databases/database-1/collection-2.dat"));
        assert!(!volume.exists("databases/database-1/collection-2.compact"));
    }

    #[test]
    fn sweep_removes_unreferenced_entries() {
        let (dir, volume) = memory_dir(Arc::new(NoFaults));
        volume.create_dir("databases/tmp-database-9").unwrap();
        volume.create_dir("databases/database-7").unwrap();
        volume
            .write_atomic("databases/database-1/collection-3.dat", b"")
            .unwrap();
        volume
            .write_atomic("databases/database-1/collection-8.dat", b"")
            .unwrap();

        let mut manifest = Manifest::new();
        let mut collections = BTreeMap::new();
        collections.insert(
            CollectionId::new(3),
            crate::manifest::CollectionMeta {
                id: CollectionId::new(3),
                name: "c".into(),
                globally_unique_id: uuid::Uuid::new_v4(),
                options: Default::default(),
                count: 0,
                dropped: false,
                indexes: Vec::new(),
            },
        );
        manifest.databases.insert(
            DatabaseId::new(1),
            DatabaseMeta {
                id: DatabaseId::new(1),
                name: "d".into(),
                options: Default::default(),
                dropped: false,
                collections,
            },
        );

        assert_eq!(dir.sweep_orphans(&manifest).unwrap(), 3);
        assert_eq!(volume.list("databases").unwrap(), vec!["database-1"]);
        assert_eq!(
            volume.list("databases/database-1").unwrap(),
            vec!["collection-3.dat"]
        );
    }
}
