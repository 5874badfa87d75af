//! Benchmark utilities.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use vellum_core::{CatalogService, Collection, CollectionOptions, Config, NoFaults};
use vellum_storage::MemoryVolume;

/// Name of the collection every helper uses.
pub const COLLECTION: &str = "bench";

/// Engine configuration for benchmarks: collection only when asked.
pub fn bench_config() -> Config {
    Config::default().background_collector(false)
}

/// A random alphanumeric string of `len` characters.
pub fn random_text(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A document body with key `key` and a payload of roughly `size` bytes.
pub fn document(key: &str, size: usize) -> Value {
    let group = rand::thread_rng().gen_range(0..16u32);
    json!({
        "_key": key,
        "group": group,
        "payload": random_text(size),
    })
}

/// Key of the `i`-th benchmark document.
pub fn key(i: usize) -> String {
    format!("k{i:08}")
}

/// Opens an in-memory engine on `volume` and returns the bench collection,
/// creating it if needed.
pub fn open(volume: &MemoryVolume) -> (CatalogService, Collection) {
    let service = CatalogService::open_with_volume(
        Arc::new(volume.clone()),
        bench_config(),
        Arc::new(NoFaults),
    )
    .expect("open engine");
    let db = service.system().expect("system database");
    let collection = match db.collection(COLLECTION) {
        Ok(collection) => collection,
        Err(_) => db
            .create_collection(COLLECTION, CollectionOptions::default())
            .expect("create collection"),
    };
    (service, collection)
}

/// Inserts `count` documents of `size` bytes.
pub fn populate(collection: &Collection, count: usize, size: usize) {
    for i in 0..count {
        collection
            .insert(document(&key(i), size))
            .expect("insert");
    }
}
