//! Crash and restart behaviour of the engine.

use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use vellum_core::{
    CatalogService, CollectionOptions, Config, FailMode, FailPoints, NoFaults, RecoveryState,
    TransactionOptions,
};
use vellum_storage::fault::points;
use vellum_storage::MemoryVolume;

fn quiet() -> Config {
    Config::default().background_collector(false)
}

fn open(volume: &MemoryVolume) -> CatalogService {
    CatalogService::open_with_volume(Arc::new(volume.clone()), quiet(), Arc::new(NoFaults)).unwrap()
}

fn crash(service: CatalogService, volume: &MemoryVolume) {
    service.crash();
    drop(service);
    volume.simulate_crash();
}

#[test]
fn committed_writes_survive_a_crash_before_collection() {
    let volume = MemoryVolume::new();
    let service = open(&volume);
    let c = service
        .system()
        .unwrap()
        .create_collection("c", CollectionOptions::default())
        .unwrap();
    for i in 0..50 {
        c.insert(json!({"_key": format!("k{i}"), "n": i})).unwrap();
    }
    c.remove("k7", None).unwrap();
    c.update("k8", json!({"n": 800}), None).unwrap();
    crash(service, &volume);

    let service = open(&volume);
    let report = service.recovery_report();
    assert_eq!(report.state, RecoveryState::Consistent);
    assert!(!report.clean_shutdown);
    assert_eq!(report.replayed, 52);

    let c = service.system().unwrap().collection("c").unwrap();
    assert_eq!(c.count(), 49);
    assert!(c.get("k7").unwrap().is_none());
    assert_eq!(c.get("k8").unwrap().unwrap().field("n"), Some(json!(800)));
}

#[test]
fn replay_after_partial_collection_applies_each_entry_once() {
    let volume = MemoryVolume::new();
    let service = open(&volume);
    let c = service
        .system()
        .unwrap()
        .create_collection("c", CollectionOptions::default())
        .unwrap();
    for i in 0..10 {
        c.insert(json!({"_key": format!("a{i}")})).unwrap();
    }
    service.flush_wal(true).unwrap();
    for i in 0..5 {
        c.insert(json!({"_key": format!("b{i}")})).unwrap();
    }
    c.remove("a0", None).unwrap();
    crash(service, &volume);

    let service = open(&volume);
    let c = service.system().unwrap().collection("c").unwrap();
    assert_eq!(c.count(), 14);
    service.flush_wal(true).unwrap();
    crash(service, &volume);

    let service = open(&volume);
    let c = service.system().unwrap().collection("c").unwrap();
    assert_eq!(c.count(), 14);
    assert_eq!(c.all().unwrap().len(), 14);
    assert_eq!(c.recalculate_count().unwrap(), 14);
}

#[test]
fn uncommitted_transaction_is_discarded() {
    let volume = MemoryVolume::new();
    let service = open(&volume);
    let db = service.system().unwrap();
    db.create_collection("c", CollectionOptions::default()).unwrap();

    let mut txn = db.begin(TransactionOptions::new().write(["c"])).unwrap();
    txn.insert("c", json!({"_key": "lost"})).unwrap();
    crash(service, &volume);
    drop(txn);

    let service = open(&volume);
    let c = service.system().unwrap().collection("c").unwrap();
    assert!(c.get("lost").unwrap().is_none());
    assert_eq!(c.count(), 0);
}

#[test]
fn intermediate_commits_survive_a_failed_transaction() {
    let volume = MemoryVolume::new();
    let faults = Arc::new(FailPoints::new());
    let service =
        CatalogService::open_with_volume(Arc::new(volume.clone()), quiet(), faults.clone()).unwrap();
    let db = service.system().unwrap();
    db.create_collection("c", CollectionOptions::default()).unwrap();

    faults.set_fail_with(points::TRANSACTION_WRITE_DOCUMENT, FailMode::FromHit(20_000));
    let mut txn = db
        .begin(
            TransactionOptions::new()
                .write(["c"])
                .intermediate_commit_count(1000),
        )
        .unwrap();
    let mut failed = None;
    for i in 0..20_001 {
        if let Err(err) = txn.insert("c", json!({"value": i})) {
            failed = Some(i);
            assert!(err.is_injected());
            break;
        }
    }
    assert_eq!(failed, Some(19_999));
    drop(txn);
    faults.clear_all();

    let c = db.collection("c").unwrap();
    assert_eq!(c.count(), 19_000);
    crash(service, &volume);

    let service = open(&volume);
    let c = service.system().unwrap().collection("c").unwrap();
    assert_eq!(c.count(), 19_000);
    assert_eq!(c.all().unwrap().len(), 19_000);
}

#[test]
fn torn_wal_tail_is_cut_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let service = CatalogService::open(dir.path(), quiet()).unwrap();
    let c = service
        .system()
        .unwrap()
        .create_collection("c", CollectionOptions::default())
        .unwrap();
    c.insert(json!({"_key": "kept"})).unwrap();
    service.crash();
    drop((c, service));

    let mut wal = std::fs::OpenOptions::new()
        .append(true)
        .open(dir.path().join("wal.log"))
        .unwrap();
    wal.write_all(b"VWAL\x01").unwrap();
    drop(wal);

    let service = CatalogService::open(dir.path(), quiet()).unwrap();
    assert_eq!(service.recovery_report().torn_bytes, 5);
    let c = service.system().unwrap().collection("c").unwrap();
    assert!(c.get("kept").unwrap().is_some());
    service.close().unwrap();
}

#[test]
fn damaged_wal_length_halts_open_without_truncating() {
    let dir = tempfile::tempdir().unwrap();
    let service = CatalogService::open(dir.path(), quiet()).unwrap();
    let c = service
        .system()
        .unwrap()
        .create_collection("c", CollectionOptions::default())
        .unwrap();
    for key in ["a", "b", "c"] {
        c.insert(json!({"_key": key})).unwrap();
    }
    service.crash();
    drop((c, service));

    let wal_path = dir.path().join("wal.log");
    let mut bytes = std::fs::read(&wal_path).unwrap();
    let len_before = bytes.len();
    bytes[17] = 0x7f;
    std::fs::write(&wal_path, &bytes).unwrap();

    assert!(matches!(
        CatalogService::open(dir.path(), quiet()),
        Err(vellum_core::CoreError::WalCorruption { .. })
    ));
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), len_before as u64);
}

#[test]
fn clean_close_then_reopen_keeps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let service = CatalogService::open(dir.path(), Config::default()).unwrap();
    let db = service.create_database("shop", Default::default()).unwrap();
    let c = db.create_collection("orders", CollectionOptions::default()).unwrap();
    for i in 0..100 {
        c.insert(json!({"n": i})).unwrap();
    }
    service.close().unwrap();
    drop((c, db, service));

    let service = CatalogService::open(dir.path(), Config::default()).unwrap();
    assert!(service.recovery_report().clean_shutdown);
    assert_eq!(service.recovery_report().replayed, 0);
    let c = service.database("shop").unwrap().collection("orders").unwrap();
    assert_eq!(c.count(), 100);
}

#[test]
fn second_open_of_a_directory_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let _first = CatalogService::open(dir.path(), quiet()).unwrap();
    assert!(matches!(
        CatalogService::open(dir.path(), quiet()),
        Err(vellum_core::CoreError::DatabaseLocked)
    ));
}

#[derive(Debug, Clone)]
enum Step {
    Put(u8, u8),
    Remove(u8),
    Collect,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0u8..16, any::<u8>()).prop_map(|(k, v)| Step::Put(k, v)),
        2 => (0u8..16).prop_map(Step::Remove),
        1 => Just(Step::Collect),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn recovered_state_matches_committed_history(steps in prop::collection::vec(step(), 1..60)) {
        let volume = MemoryVolume::new();
        let service = open(&volume);
        let c = service
            .system()
            .unwrap()
            .create_collection("c", CollectionOptions::default())
            .unwrap();
        let mut model: BTreeMap<String, u8> = BTreeMap::new();

        for step in &steps {
            match step {
                Step::Put(k, v) => {
                    let key = format!("k{k}");
                    if model.contains_key(&key) {
                        c.replace(&key, json!({"v": v}), None).unwrap();
                    } else {
                        c.insert(json!({"_key": key, "v": v})).unwrap();
                    }
                    model.insert(key, *v);
                }
                Step::Remove(k) => {
                    let key = format!("k{k}");
                    if model.remove(&key).is_some() {
                        c.remove(&key, None).unwrap();
                    }
                }
                Step::Collect => {
                    service.flush_wal(true).unwrap();
                }
            }
        }
        crash(service, &volume);

        let service = open(&volume);
        let c = service.system().unwrap().collection("c").unwrap();
        prop_assert_eq!(c.count(), model.len() as u64);
        let stored: BTreeMap<String, u8> = c
            .all()
            .unwrap()
            .into_iter()
            .map(|doc| {
                let v = doc.field("v").and_then(|v| v.as_u64()).unwrap_or(0) as u8;
                (doc.key, v)
            })
            .collect();
        prop_assert_eq!(stored, model);
    }
}
