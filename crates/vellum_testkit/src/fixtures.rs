//! Test fixtures and engine helpers.
//!
//! Provides engines on a shared in-memory volume that survive simulated
//! crashes, plus a few ready-made scenarios.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use vellum_core::{CatalogService, Collection, CollectionOptions, Config, Database, FailPoints};
use vellum_storage::MemoryVolume;

/// Configuration tests start from: no background collector, so collection
/// happens only when a test asks for it.
pub fn quiet_config() -> Config {
    Config::default().background_collector(false)
}

/// An engine whose storage outlives it.
///
/// [`TestEngine::crash`] drops the engine without a clean shutdown and
/// throws away unsynced data; [`TestEngine::restart`] closes cleanly.
/// Either way the next engine opens the same volume.
pub struct TestEngine {
    /// The running engine.
    pub service: CatalogService,
    /// Fail points armed by the test.
    pub faults: Arc<FailPoints>,
    volume: MemoryVolume,
    config: Config,
}

impl TestEngine {
    /// Opens a fresh in-memory engine with [`quiet_config`].
    pub fn memory() -> Self {
        Self::with_config(quiet_config())
    }

    /// Opens a fresh in-memory engine.
    pub fn with_config(config: Config) -> Self {
        let volume = MemoryVolume::new();
        let faults = Arc::new(FailPoints::new());
        let service = open(&volume, config.clone(), faults.clone());
        Self {
            service,
            faults,
            volume,
            config,
        }
    }

    /// The `_system` database.
    pub fn system(&self) -> Database {
        self.service.system().expect("system database")
    }

    /// Returns `name` in `_system`, creating it if needed.
    pub fn collection(&self, name: &str) -> Collection {
        let db = self.system();
        match db.collection(name) {
            Ok(collection) => collection,
            Err(_) => db
                .create_collection(name, CollectionOptions::default())
                .expect("create collection"),
        }
    }

    /// The volume under the engine.
    pub fn volume(&self) -> &MemoryVolume {
        &self.volume
    }

    /// Kills the engine and reopens it. Fail points are disarmed first.
    pub fn crash(self) -> Self {
        self.service.crash();
        self.reopen(true)
    }

    /// Closes the engine cleanly and reopens it.
    pub fn restart(self) -> Self {
        self.service.close().expect("clean close");
        self.reopen(false)
    }

    fn reopen(self, lose_unsynced: bool) -> Self {
        let Self {
            service,
            faults,
            volume,
            config,
        } = self;
        drop(service);
        if lose_unsynced {
            volume.simulate_crash();
        }
        faults.clear_all();
        let service = open(&volume, config.clone(), faults.clone());
        Self {
            service,
            faults,
            volume,
            config,
        }
    }
}

fn open(volume: &MemoryVolume, config: Config, faults: Arc<FailPoints>) -> CatalogService {
    CatalogService::open_with_volume(Arc::new(volume.clone()), config, faults)
        .expect("open engine")
}

/// An engine in a temporary directory on disk.
pub struct DiskEngine {
    /// The running engine.
    pub service: CatalogService,
    dir: TempDir,
}

impl DiskEngine {
    /// Opens an engine in a new temporary directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let service = CatalogService::open(dir.path(), quiet_config()).expect("open engine");
        Self { service, dir }
    }

    /// The data directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Closes and reopens from disk.
    pub fn restart(self) -> Self {
        let Self { service, dir } = self;
        service.close().expect("clean close");
        drop(service);
        let service = CatalogService::open(dir.path(), quiet_config()).expect("reopen engine");
        Self { service, dir }
    }
}

impl Default for DiskEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` against a throwaway in-memory engine.
///
/// # Example
///
/// ```rust
/// use vellum_testkit::with_temp_engine;
///
/// let count = with_temp_engine(|engine| {
///     let c = engine.collection("test");
///     c.insert(serde_json::json!({"a": 1})).unwrap();
///     c.count()
/// });
/// assert_eq!(count, 1);
/// ```
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::memory();
    f(&engine)
}

/// Ready-made engine states.
pub mod scenarios {
    use super::*;

    /// An engine whose `test` collection holds `count` documents keyed
    /// `k0000`, `k0001`, ...
    pub fn populated_collection(count: usize) -> TestEngine {
        let engine = TestEngine::memory();
        let collection = engine.collection("test");
        for i in 0..count {
            collection
                .insert(json!({"_key": format!("k{i:04}"), "index": i}))
                .expect("insert");
        }
        engine
    }

    /// An engine with `count` collections `collection_0`, ... holding one
    /// document each.
    pub fn multi_collection(count: usize) -> (TestEngine, Vec<String>) {
        let engine = TestEngine::memory();
        let names: Vec<String> = (0..count).map(|i| format!("collection_{i}")).collect();
        for (i, name) in names.iter().enumerate() {
            engine
                .collection(name)
                .insert(json!({"collection": i}))
                .expect("insert");
        }
        (engine, names)
    }
}
