//! The engine and its public face, [`CatalogService`].
//!
//! Opening an engine:
//!
//! 1. load the manifest (or create one),
//! 2. remove orphans of interrupted catalog operations,
//! 3. open the datafiles of live collections,
//! 4. scan the WAL, cut a torn tail and replay committed entries,
//! 5. seed the revision clock and the WAL sequence counter,
//! 6. build secondary indexes,
//! 7. create `_system` if missing and start the collector.
//!
//! Lock order, outermost first: collect lock, commit lock, collection
//! data locks (by collection id), datafile mutexes. The manifest mutex and
//! the catalog lock are leaves: nothing else is acquired while holding them
//! except the catalog lock under the manifest mutex.

use crate::catalog::Database;
use crate::clock::HybridLogicalClock;
use crate::collection::CollectionState;
use crate::collector::{CollectStats, CollectorThread, QueuedOp};
use crate::config::{Config, DatabaseOptions};
use crate::dir::DataDir;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexSet;
use crate::manifest::{DatabaseMeta, Manifest};
use crate::recovery::{Recovery, RecoveryReport};
use crate::types::{CollectionId, DatabaseId};
use crate::wal::{self, WalRecord, WalWriter};
use crate::SYSTEM_DATABASE;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
#[cfg(feature = "std")]
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use vellum_storage::fault::points;
use vellum_storage::{FaultController, MemoryVolume, NoFaults, Volume};

/// An open database.
#[derive(Debug)]
pub(crate) struct DatabaseState {
    pub(crate) id: DatabaseId,
    pub(crate) name: String,
    pub(crate) options: DatabaseOptions,
    pub(crate) dropped: AtomicBool,
}

impl DatabaseState {
    pub(crate) fn from_meta(meta: &DatabaseMeta) -> Self {
        Self {
            id: meta.id,
            name: meta.name.clone(),
            options: meta.options.clone(),
            dropped: AtomicBool::new(meta.dropped),
        }
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Open databases and collections. Dropped objects stay here until they
/// are reclaimed.
#[derive(Debug, Default)]
pub(crate) struct CatalogState {
    pub(crate) databases: BTreeMap<DatabaseId, Arc<DatabaseState>>,
    pub(crate) collections: BTreeMap<CollectionId, Arc<CollectionState>>,
}

pub(crate) struct Engine {
    pub(crate) config: Config,
    pub(crate) dir: DataDir,
    pub(crate) faults: Arc<dyn FaultController>,
    pub(crate) wal: WalWriter,
    pub(crate) clock: HybridLogicalClock,
    pub(crate) manifest: Mutex<Manifest>,
    pub(crate) catalog: RwLock<CatalogState>,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) collect_lock: Mutex<()>,
    pub(crate) queue: Mutex<VecDeque<QueuedOp>>,
    pub(crate) next_txid: AtomicU64,
    pub(crate) last_checkpoint: AtomicU64,
    pub(crate) closed: AtomicBool,
    pub(crate) halted: AtomicBool,
    pub(crate) report: RecoveryReport,
    collector: Mutex<Option<CollectorThread>>,
}

impl Engine {
    fn open(dir: DataDir, config: Config, faults: Arc<dyn FaultController>) -> CoreResult<Arc<Self>> {
        let (mut manifest, existed) = match dir.load_manifest()? {
            Some(manifest) => (manifest, true),
            None if config.create_if_missing => (Manifest::new(), false),
            None => {
                return Err(CoreError::invalid_operation(
                    "data directory holds no manifest",
                ))
            }
        };
        let clean_shutdown = existed && manifest.clean_shutdown;
        dir.sweep_orphans(&manifest)?;

        let clock = HybridLogicalClock::new();
        clock.observe(manifest.max_revision);

        let mut catalog = CatalogState::default();
        for db in manifest.databases.values().filter(|db| !db.dropped) {
            catalog
                .databases
                .insert(db.id, Arc::new(DatabaseState::from_meta(db)));
            for meta in db.live_collections() {
                let datafile = dir.open_datafile(db.id, meta.id)?;
                clock.observe(datafile.max_revision());
                // The collector may have written the datafile and failed
                // before persisting its count.
                let count = if datafile.applied_seq() > manifest.collected_seq {
                    datafile.live_count()
                } else {
                    meta.count
                };
                let state = CollectionState::new(
                    meta.id,
                    db.id,
                    meta.name.clone(),
                    meta.globally_unique_id,
                    meta.options.clone(),
                    datafile,
                    count,
                );
                catalog.collections.insert(meta.id, Arc::new(state));
            }
        }

        let mut wal_backend = dir.open_wal()?;
        let scan = wal::scan(&wal_backend.read_all()?)?;
        if scan.torn_bytes > 0 {
            tracing::warn!(torn_bytes = scan.torn_bytes, "cutting torn WAL tail");
            wal_backend.truncate(scan.valid_len)?;
            wal_backend.sync()?;
        }
        let max_txid = scan
            .entries
            .iter()
            .filter_map(|entry| entry.record.txid())
            .map(|txid| txid.as_u64())
            .max()
            .unwrap_or(0);
        let wal_last = scan.last_sequence().unwrap_or_default();

        let mut recovery = Recovery::new();
        let plan = recovery.scan(scan)?;
        clock.observe(plan.max_revision);
        let queued = recovery.replay(plan, &catalog.collections, manifest.collected_seq)?;
        let report = recovery.finish(clean_shutdown)?;

        let next_sequence = wal_last
            .max(manifest.last_seq)
            .max(manifest.collected_seq)
            .next();
        let wal = WalWriter::new(wal_backend, next_sequence, config.max_wal_size, Arc::clone(&faults))?;

        for state in catalog.collections.values() {
            let Some((_, meta)) = manifest.collection(state.id) else {
                continue;
            };
            let docs = state.scan()?;
            let mut indexes = IndexSet::new();
            for definition in &meta.indexes {
                let index = IndexSet::build(definition.clone(), &docs)
                    .map_err(|detail| CoreError::unique_violated(state.name.clone(), detail))?;
                indexes.add(index);
            }
            state.data.write().indexes = indexes;
        }

        manifest.clean_shutdown = false;
        manifest.max_revision = manifest.max_revision.max(clock.last());
        dir.save_manifest(&manifest)?;

        let needs_system = manifest.live_database(SYSTEM_DATABASE).is_none();
        let engine = Arc::new(Self {
            config,
            dir,
            faults,
            wal,
            clock,
            manifest: Mutex::new(manifest),
            catalog: RwLock::new(catalog),
            commit_lock: Mutex::new(()),
            collect_lock: Mutex::new(()),
            queue: Mutex::new(queued.into()),
            next_txid: AtomicU64::new(max_txid + 1),
            last_checkpoint: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            report,
            collector: Mutex::new(None),
        });

        if needs_system {
            engine.create_database(SYSTEM_DATABASE, DatabaseOptions::default())?;
        }
        if engine.config.background_collector {
            let thread =
                CollectorThread::spawn(Arc::downgrade(&engine), engine.config.collector_interval)?;
            *engine.collector.lock() = Some(thread);
        }
        tracing::info!(
            databases = engine.catalog.read().databases.len(),
            collections = engine.catalog.read().collections.len(),
            "engine opened"
        );
        Ok(engine)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            Err(CoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn stop_collector(&self) {
        if let Some(thread) = self.collector.lock().take() {
            thread.stop();
        }
    }

    pub(crate) fn flush(&self, wait: bool) -> CoreResult<Option<CollectStats>> {
        self.ensure_open()?;
        if !wait {
            if let Some(thread) = self.collector.lock().as_ref() {
                thread.wake();
                return Ok(None);
            }
        }
        if self.halted.load(Ordering::Acquire) {
            return Err(CoreError::invalid_operation("collector halted"));
        }
        self.collect_once().map(Some)
    }

    fn close(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.stop_collector();
        if !self.halted.load(Ordering::Acquire) {
            if let Err(err) = self.collect_once() {
                tracing::warn!(error = %err, "final collector pass failed");
            }
        }
        self.closed.store(true, Ordering::Release);

        if self.faults.should_fail(points::WRITE_SHUTDOWN) {
            tracing::warn!("skipping clean shutdown marker");
            return Ok(());
        }
        self.wal.append(&WalRecord::Shutdown)?;
        self.wal.sync()?;
        let mut manifest = self.manifest.lock();
        manifest.clean_shutdown = true;
        manifest.max_revision = manifest.max_revision.max(self.clock.last());
        self.dir.save_manifest(&manifest)?;
        tracing::info!("engine closed");
        Ok(())
    }

    fn crash(&self) {
        self.stop_collector();
        self.closed.store(true, Ordering::Release);
        tracing::warn!("engine terminated without shutdown");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.dir)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Entry point: owns one data directory and everything in it.
///
/// Handles are cheap to clone and share the engine. There are no globals;
/// pass the service to whatever needs it.
///
/// # Example
///
/// ```rust
/// use vellum_core::{CatalogService, CollectionOptions, Config};
/// use serde_json::json;
///
/// let service = CatalogService::open_in_memory(Config::default()).unwrap();
/// let db = service.system().unwrap();
/// let users = db.create_collection("users", CollectionOptions::default()).unwrap();
/// let meta = users.insert(json!({"name": "Ada"})).unwrap();
/// assert_eq!(users.get(&meta.key).unwrap().unwrap().field("name"), Some(json!("Ada")));
/// service.close().unwrap();
/// ```
#[derive(Clone)]
pub struct CatalogService {
    pub(crate) engine: Arc<Engine>,
}

impl CatalogService {
    /// Opens a data directory on the OS file system.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseLocked`] if another process has it open,
    /// or any error recovery runs into.
    #[cfg(feature = "std")]
    pub fn open(path: &Path, config: Config) -> CoreResult<Self> {
        Self::open_with_faults(path, config, Arc::new(NoFaults))
    }

    /// Like [`CatalogService::open`] with a fault controller.
    ///
    /// # Errors
    ///
    /// See [`CatalogService::open`].
    #[cfg(feature = "std")]
    pub fn open_with_faults(
        path: &Path,
        config: Config,
        faults: Arc<dyn FaultController>,
    ) -> CoreResult<Self> {
        let dir = DataDir::open_path(path, config.create_if_missing, Arc::clone(&faults))?;
        Ok(Self {
            engine: Engine::open(dir, config, faults)?,
        })
    }

    /// Opens a data directory on any volume.
    ///
    /// # Errors
    ///
    /// Returns any error recovery runs into.
    pub fn open_with_volume(
        volume: Arc<dyn Volume>,
        config: Config,
        faults: Arc<dyn FaultController>,
    ) -> CoreResult<Self> {
        let dir = DataDir::with_volume(volume, Arc::clone(&faults));
        Ok(Self {
            engine: Engine::open(dir, config, faults)?,
        })
    }

    /// Opens a fresh in-memory engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial catalog cannot be written.
    pub fn open_in_memory(config: Config) -> CoreResult<Self> {
        Self::open_with_volume(Arc::new(MemoryVolume::new()), config, Arc::new(NoFaults))
    }

    /// Flushes, writes the clean-shutdown marker and closes. Later calls on
    /// any handle fail with [`CoreError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the marker or the manifest cannot be written.
    pub fn close(&self) -> CoreResult<()> {
        self.engine.close()
    }

    /// Stops immediately, as if the process had been killed: no collection,
    /// no shutdown marker.
    pub fn crash(&self) {
        self.engine.crash();
    }

    /// Returns true once closed or crashed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// What recovery did when this engine was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.engine.report
    }

    /// The fault controller in use.
    #[must_use]
    pub fn faults(&self) -> &Arc<dyn FaultController> {
        &self.engine.faults
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.engine.config
    }

    /// Wakes the collector. With `wait`, runs a full pass on this thread and
    /// returns its statistics.
    ///
    /// # Errors
    ///
    /// Returns the pass's error, such as an injected collector fault.
    pub fn flush_wal(&self, wait: bool) -> CoreResult<Option<CollectStats>> {
        self.engine.flush(wait)
    }

    /// Reclaims dropped collections and databases now. Returns how many
    /// objects were reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if files cannot be removed or the manifest written.
    pub fn run_cleanup(&self) -> CoreResult<usize> {
        self.engine.ensure_open()?;
        let _collect = self.engine.collect_lock.lock();
        self.engine.cleanup_locked()
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.engine.wal.size()
    }

    /// Creates a database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`], [`CoreError::ResourceLimit`],
    /// [`CoreError::Validation`] or an I/O error from directory creation.
    pub fn create_database(&self, name: &str, options: DatabaseOptions) -> CoreResult<Database> {
        let state = self.engine.create_database(name, options)?;
        Ok(Database::new(Arc::clone(&self.engine), state))
    }

    /// Returns a live database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotFound`].
    pub fn database(&self, name: &str) -> CoreResult<Database> {
        self.engine.ensure_open()?;
        let state = self.engine.live_database(name)?;
        Ok(Database::new(Arc::clone(&self.engine), state))
    }

    /// Returns `_system`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after close.
    pub fn system(&self) -> CoreResult<Database> {
        self.database(SYSTEM_DATABASE)
    }

    /// Names of live databases, sorted.
    #[must_use]
    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .engine
            .catalog
            .read()
            .databases
            .values()
            .filter(|db| !db.is_dropped())
            .map(|db| db.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drops a database: it disappears now, its files go at the next
    /// cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotFound`], or
    /// [`CoreError::InvalidOperation`] for `_system`.
    pub fn drop_database(&self, name: &str) -> CoreResult<()> {
        self.engine.drop_database(name)
    }

    /// Number of databases holding a slot: live ones plus dropped ones not
    /// yet reclaimed.
    #[must_use]
    pub fn database_slots(&self) -> usize {
        self.engine.manifest.lock().database_slots()
    }
}

impl fmt::Debug for CatalogService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogService")
            .field("engine", &self.engine)
            .finish()
    }
}
