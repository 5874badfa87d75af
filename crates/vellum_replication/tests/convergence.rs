//! Follower convergence against a leader, with and without malarkey.

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vellum_core::{
    CatalogService, Collection, CollectionOptions, Config, Database, Document, FailMode,
    FailPoints, Revision, TransactionOptions,
};
use vellum_replication::{
    LeaderService, LoopbackTransport, MalarkeyConfig, MalarkeyTransport, ReplicationEngine,
    ReplicationError, ReplicationTask, RetryConfig, SyncConfig, SyncMode,
};
use vellum_storage::fault::points;

struct Pair {
    leader: CatalogService,
    follower: CatalogService,
    leader_service: Arc<LeaderService>,
}

impl Pair {
    fn new(revision_tree: bool) -> Self {
        let quiet = || Config::default().background_collector(false);
        let leader = CatalogService::open_in_memory(quiet()).unwrap();
        let follower = CatalogService::open_in_memory(quiet()).unwrap();
        for service in [&leader, &follower] {
            service
                .system()
                .unwrap()
                .create_collection("c", CollectionOptions::default())
                .unwrap();
        }
        let leader_service =
            Arc::new(LeaderService::new(leader.clone()).with_revision_tree(revision_tree));
        Self {
            leader,
            follower,
            leader_service,
        }
    }

    fn leader_c(&self) -> Collection {
        self.leader.system().unwrap().collection("c").unwrap()
    }

    fn follower_db(&self) -> Database {
        self.follower.system().unwrap()
    }

    fn follower_c(&self) -> Collection {
        self.follower_db().collection("c").unwrap()
    }

    fn loopback(&self) -> LoopbackTransport {
        LoopbackTransport::new(self.leader_service.clone())
    }

    fn assert_converged(&self) {
        let mut leader = self.leader_c().all().unwrap();
        let mut follower = self.follower_c().all().unwrap();
        leader.sort_by(|a, b| a.key.cmp(&b.key));
        follower.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(leader.len(), follower.len());
        assert_eq!(leader, follower);
        assert_eq!(self.follower_c().count(), self.leader_c().count());
    }
}

fn config(mode: SyncMode) -> SyncConfig {
    SyncConfig::new(mode)
        .with_chunk_size(16)
        .with_bucket_count(8)
        .with_fetch_batch_size(25)
        .with_dump_chunks(10, 40)
        .with_retry(RetryConfig::immediate(60))
}

fn fill(c: &Collection, n: usize) {
    for i in 0..n {
        c.insert(json!({"_key": format!("k{i:04}"), "n": i})).unwrap();
    }
}

/// Writes a document with an explicit revision on the follower.
fn plant(db: &Database, key: &str, rev: u64, body: serde_json::Value) {
    let body = body.as_object().unwrap().clone();
    let mut txn = db.begin(TransactionOptions::new().exclusive(["c"])).unwrap();
    txn.put_replica("c", Document::new(key, Revision::new(rev), body))
        .unwrap();
    txn.commit().unwrap();
}

/// Copies the leader, then makes both sides drift apart.
fn diverge(pair: &Pair) {
    let leader = pair.leader_c();
    fill(&leader, 200);
    ReplicationEngine::new(config(SyncMode::Keys), pair.loopback())
        .sync(&pair.follower_db(), "c")
        .unwrap();

    for i in 0..20 {
        leader
            .update(&format!("k{i:04}"), json!({"n": 1000 + i}), None)
            .unwrap();
    }
    for i in 20..30 {
        leader.remove(&format!("k{i:04}"), None).unwrap();
    }
    for i in 0..30 {
        leader.insert(json!({"_key": format!("new{i}")})).unwrap();
    }

    let follower = pair.follower_c();
    for i in 0..15 {
        follower.insert(json!({"_key": format!("local{i}")})).unwrap();
    }
    for i in 100..105 {
        follower.remove(&format!("k{i:04}"), None).unwrap();
    }
    for i in 150..155 {
        plant(&pair.follower_db(), &format!("k{i:04}"), 1, json!({"stale": true}));
    }
}

#[test]
fn empty_follower_gets_a_full_dump() {
    let pair = Pair::new(true);
    fill(&pair.leader_c(), 250);

    let engine = ReplicationEngine::new(
        config(SyncMode::Auto).with_intermediate_commit_count(7),
        pair.loopback(),
    );
    let report = engine.sync(&pair.follower_db(), "c").unwrap();

    assert!(report.dumped);
    assert!(report.converged);
    assert_eq!(report.fetched, 250);
    assert_eq!(report.rounds, 1);
    pair.assert_converged();
}

#[test]
fn keys_mode_converges_under_malarkey() {
    let pair = Pair::new(true);
    diverge(&pair);

    let transport = MalarkeyTransport::new(pair.loopback(), MalarkeyConfig::noisy(17));
    let engine = ReplicationEngine::new(config(SyncMode::Keys), transport);
    let report = engine.sync(&pair.follower_db(), "c").unwrap();

    assert!(report.converged);
    assert_eq!(report.mode, SyncMode::Keys);
    assert!(!report.dumped);
    assert!(report.retries > 0);
    let stats = engine.transport().stats();
    assert!(stats.dropped_requests + stats.dropped_responses + stats.timeouts > 0);
    pair.assert_converged();
}

#[test]
fn revisions_mode_converges_under_malarkey() {
    let pair = Pair::new(true);
    diverge(&pair);

    let transport = MalarkeyTransport::new(pair.loopback(), MalarkeyConfig::noisy(29));
    let engine = ReplicationEngine::new(config(SyncMode::Revisions), transport);
    let report = engine.sync(&pair.follower_db(), "c").unwrap();

    assert!(report.converged);
    assert_eq!(report.mode, SyncMode::Revisions);
    assert!(report.removed >= 15);
    pair.assert_converged();
}

#[test]
fn auto_mode_falls_back_to_keys_on_an_old_leader() {
    let pair = Pair::new(false);
    diverge(&pair);

    let engine = ReplicationEngine::new(config(SyncMode::Auto), pair.loopback());
    let report = engine.sync(&pair.follower_db(), "c").unwrap();

    assert_eq!(report.mode, SyncMode::Keys);
    assert!(report.converged);
    assert_eq!(engine.stats().fallbacks, 1);
    pair.assert_converged();
}

#[test]
fn revisions_mode_needs_a_new_leader() {
    let pair = Pair::new(false);
    fill(&pair.follower_c(), 1);

    let engine = ReplicationEngine::new(config(SyncMode::Revisions), pair.loopback());
    assert!(matches!(
        engine.sync(&pair.follower_db(), "c"),
        Err(ReplicationError::NotImplemented { .. })
    ));
}

#[test]
fn unreachable_leader_fails_after_all_attempts() {
    let pair = Pair::new(true);
    let transport = pair.loopback();
    transport.set_connected(false);

    let engine = ReplicationEngine::new(
        config(SyncMode::Keys).with_retry(RetryConfig::immediate(3)),
        transport,
    );
    let err = engine.sync(&pair.follower_db(), "c").unwrap_err();
    assert!(matches!(
        err,
        ReplicationError::LeaderUnreachable { attempts: 3, .. }
    ));
    assert_eq!(engine.stats().syncs_failed, 1);
    assert_eq!(pair.leader_service.handled(), 0);
}

#[test]
fn always_dropping_transport_is_unreachable() {
    let pair = Pair::new(true);
    let transport = MalarkeyTransport::new(
        pair.loopback(),
        MalarkeyConfig::new(5).with_drop_response(1.0),
    );
    let engine = ReplicationEngine::new(
        config(SyncMode::Keys).with_retry(RetryConfig::immediate(4)),
        transport,
    );
    assert!(matches!(
        engine.sync(&pair.follower_db(), "c"),
        Err(ReplicationError::LeaderUnreachable { .. })
    ));
    // The leader answered every attempt; the answers were lost.
    assert_eq!(pair.leader_service.handled(), 4);
}

#[test]
fn same_revision_with_another_body_is_a_conflict() {
    for mode in [SyncMode::Keys, SyncMode::Revisions] {
        let pair = Pair::new(true);
        fill(&pair.leader_c(), 3);
        let original = pair.leader_c().get("k0001").unwrap().unwrap();
        plant(
            &pair.follower_db(),
            "k0001",
            original.rev.as_u64(),
            json!({"n": "forged"}),
        );

        let engine = ReplicationEngine::new(config(mode), pair.loopback());
        let err = engine.sync(&pair.follower_db(), "c").unwrap_err();
        match err {
            ReplicationError::Conflict { key, rev } => {
                assert_eq!(key, "k0001");
                assert_eq!(rev, original.rev.as_u64());
            }
            other => panic!("{mode:?}: expected conflict, got {other}"),
        }
    }
}

#[test]
fn failed_apply_batch_is_repaired_by_the_next_round() {
    let pair = Pair::new(true);
    diverge(&pair);

    let faults = Arc::new(FailPoints::new());
    faults.set_fail_with(points::REPLICATION_APPLY_BATCH, FailMode::Once);
    let engine =
        ReplicationEngine::new(config(SyncMode::Revisions), pair.loopback()).with_faults(faults.clone());
    let report = engine.sync(&pair.follower_db(), "c").unwrap();

    assert_eq!(faults.fired(points::REPLICATION_APPLY_BATCH), 1);
    assert_eq!(report.failed_batches, 1);
    assert!(report.rounds >= 2);
    assert!(report.converged);
    pair.assert_converged();
}

#[test]
fn forced_timeouts_are_retried() {
    let pair = Pair::new(true);
    fill(&pair.leader_c(), 40);

    let faults = Arc::new(FailPoints::with_seed(99));
    faults.set_fail_with(points::REPLICATION_RANDOM_TIMEOUT, FailMode::Probability(0.3));
    let transport =
        MalarkeyTransport::new(pair.loopback(), MalarkeyConfig::new(1)).with_faults(faults);
    let engine = ReplicationEngine::new(config(SyncMode::Auto), transport);
    let report = engine.sync(&pair.follower_db(), "c").unwrap();

    assert!(report.converged);
    assert_eq!(engine.transport().stats().timeouts, report.retries);
    pair.assert_converged();
}

#[test]
fn a_moving_leader_is_followed_across_syncs() {
    let pair = Pair::new(true);
    fill(&pair.leader_c(), 30);
    let engine = ReplicationEngine::new(config(SyncMode::Auto), pair.loopback());
    assert!(engine.sync(&pair.follower_db(), "c").unwrap().dumped);

    let leader = pair.leader_c();
    leader.remove("k0003", None).unwrap();
    leader.insert(json!({"_key": "late"})).unwrap();
    let report = engine.sync(&pair.follower_db(), "c").unwrap();

    assert!(!report.dumped);
    assert_eq!(report.fetched, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(engine.stats().syncs_completed, 2);
    pair.assert_converged();
}

#[test]
fn emptied_leader_empties_the_follower() {
    let pair = Pair::new(true);
    fill(&pair.follower_c(), 12);
    let engine = ReplicationEngine::new(config(SyncMode::Keys), pair.loopback());
    let report = engine.sync(&pair.follower_db(), "c").unwrap();
    assert_eq!(report.removed, 12);
    assert_eq!(pair.follower_c().count(), 0);
}

#[tokio::test]
async fn background_task_keeps_the_follower_in_sync() {
    let pair = Pair::new(true);
    fill(&pair.leader_c(), 20);

    let engine = Arc::new(ReplicationEngine::new(
        config(SyncMode::Auto).with_sync_interval(Duration::from_millis(10)),
        pair.loopback(),
    ));
    let mut task = ReplicationTask::spawn(engine, pair.follower_db(), "c");
    assert!(task.next_outcome().await.unwrap().is_converged());
    pair.assert_converged();

    pair.leader_c().insert(json!({"_key": "later"})).unwrap();
    let mut seen = false;
    for _ in 0..50 {
        task.next_outcome().await.unwrap();
        if pair.follower_c().get("later").unwrap().is_some() {
            seen = true;
            break;
        }
    }
    assert!(seen);
    assert!(task.latest().unwrap().is_converged());
    task.shutdown().await.unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn any_malarkey_seed_converges(seed in any::<u64>(), keys_mode in any::<bool>()) {
        let pair = Pair::new(true);
        diverge(&pair);
        let mode = if keys_mode { SyncMode::Keys } else { SyncMode::Revisions };
        let transport = MalarkeyTransport::new(pair.loopback(), MalarkeyConfig::noisy(seed));
        let engine = ReplicationEngine::new(config(mode), transport);
        let report = engine.sync(&pair.follower_db(), "c").unwrap();
        prop_assert!(report.converged);
        pair.assert_converged();
    }
}
