//! Crash recovery testing for Vellum.
//!
//! Runs a workload against an engine and a [`ReferenceModel`], then kills
//! the engine at a chosen point and checks that the reopened engine holds
//! exactly the model's documents.
//!
//! ## Crash points
//!
//! 1. **After commit** - plain kill after the workload
//! 2. **Before the commit marker** - a last write fails at commit
//! 3. **During collection** - the collector fails before or during transfer
//! 4. **Mid-transaction** - a transaction with staged writes is open
//! 5. **Without shutdown marker** - clean close that skips the marker
//!
//! ## Usage
//!
//! ```rust
//! use vellum_testkit::crash::{CrashHarness, CrashPoint};
//! use vellum_testkit::model::Op;
//!
//! let ops = vec![Op::Insert { key: "a".into(), body: Default::default() }];
//! let mut harness = CrashHarness::new();
//! harness.run_all(&ops);
//! assert!(harness.all_passed(), "{}", harness.summary());
//! ```

use crate::fixtures::TestEngine;
use crate::model::{Op, ReferenceModel};
use serde_json::json;
use vellum_core::{FailMode, TransactionOptions};
use vellum_storage::fault::points;

const COLLECTION: &str = "crash";
const PROBE_KEY: &str = "crash-probe";

/// Points at which the engine is killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// After the workload, with nothing in flight.
    AfterCommit,
    /// A final insert fails before its commit marker is written.
    BeforeCommitMarker,
    /// A collector pass fails before touching datafiles.
    DuringCollectorQueue,
    /// A collector pass fails while transferring to datafiles.
    DuringCollectorTransfer,
    /// A transaction with staged, unflushed writes is open.
    MidTransaction,
    /// A clean close that fails to write the shutdown marker.
    WithoutShutdownMarker,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [CrashPoint; 6] = [
        CrashPoint::AfterCommit,
        CrashPoint::BeforeCommitMarker,
        CrashPoint::DuringCollectorQueue,
        CrashPoint::DuringCollectorTransfer,
        CrashPoint::MidTransaction,
        CrashPoint::WithoutShutdownMarker,
    ];

    /// The fail point armed for this crash, if any.
    pub fn fail_point(self) -> Option<&'static str> {
        match self {
            CrashPoint::BeforeCommitMarker => Some(points::TRANSACTION_COMMIT_FAIL),
            CrashPoint::DuringCollectorQueue => Some(points::COLLECTOR_PROCESS_QUEUED),
            CrashPoint::DuringCollectorTransfer => Some(points::COLLECTOR_TRANSFER),
            CrashPoint::WithoutShutdownMarker => Some(points::WRITE_SHUTDOWN),
            CrashPoint::AfterCommit | CrashPoint::MidTransaction => None,
        }
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// The crash point tested.
    pub point: CrashPoint,
    /// Whether the test passed.
    pub passed: bool,
    /// Expected documents after recovery.
    pub expected_documents: usize,
    /// Documents found after recovery.
    pub actual_documents: usize,
    /// What went wrong.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    fn pass(point: CrashPoint, documents: usize) -> Self {
        Self {
            point,
            passed: true,
            expected_documents: documents,
            actual_documents: documents,
            error: None,
        }
    }

    fn fail(point: CrashPoint, expected: usize, actual: usize, error: String) -> Self {
        Self {
            point,
            passed: false,
            expected_documents: expected,
            actual_documents: actual,
            error: Some(error),
        }
    }
}

/// Runs workloads through crash points and collects the results.
#[derive(Debug, Default)]
pub struct CrashHarness {
    /// Results so far.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashHarness {
    /// Creates a harness with no results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `ops`, crashes at `point`, reopens and verifies.
    pub fn run(&mut self, ops: &[Op], point: CrashPoint) -> CrashRecoveryResult {
        let result = run_one(ops, point);
        if !result.passed {
            tracing::warn!(?point, error = ?result.error, "crash recovery check failed");
        }
        self.results.push(result.clone());
        result
    }

    /// Runs `ops` once per crash point.
    pub fn run_all(&mut self, ops: &[Op]) -> Vec<CrashRecoveryResult> {
        CrashPoint::ALL
            .iter()
            .map(|point| self.run(ops, *point))
            .collect()
    }

    /// Returns true if every run passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// One line per failed run.
    pub fn summary(&self) -> String {
        let failed: Vec<String> = self
            .results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| {
                format!(
                    "{:?}: expected {} documents, found {}: {}",
                    r.point,
                    r.expected_documents,
                    r.actual_documents,
                    r.error.as_deref().unwrap_or("")
                )
            })
            .collect();
        if failed.is_empty() {
            format!("{} runs passed", self.results.len())
        } else {
            failed.join("\n")
        }
    }
}

fn run_one(ops: &[Op], point: CrashPoint) -> CrashRecoveryResult {
    let engine = TestEngine::memory();
    let collection = engine.collection(COLLECTION);
    let mut model = ReferenceModel::new();

    for op in ops {
        if let Err(err) = model.execute(op, &engine.service, &collection) {
            return CrashRecoveryResult::fail(point, model.len(), 0, err);
        }
    }
    if let Err(err) = model.verify(&collection) {
        return CrashRecoveryResult::fail(point, model.len(), 0, format!("before crash: {err}"));
    }

    if let Some(fail_point) = point.fail_point() {
        let mode = if point == CrashPoint::BeforeCommitMarker {
            FailMode::Once
        } else {
            FailMode::Always
        };
        engine.faults.set_fail_with(fail_point, mode);
    }

    let probe = match point {
        CrashPoint::BeforeCommitMarker => collection
            .insert(json!({"_key": PROBE_KEY}))
            .is_ok()
            .then_some("insert committed despite the commit fault"),
        CrashPoint::DuringCollectorQueue | CrashPoint::DuringCollectorTransfer => engine
            .service
            .flush_wal(true)
            .is_ok()
            .then_some("collector pass succeeded despite the fault"),
        _ => None,
    };
    drop(collection);
    if let Some(error) = probe {
        return CrashRecoveryResult::fail(point, model.len(), 0, error.into());
    }

    let engine = match point {
        CrashPoint::MidTransaction => {
            let staged = engine
                .system()
                .begin(TransactionOptions::new().write([COLLECTION]))
                .and_then(|mut txn| {
                    txn.insert(COLLECTION, json!({"_key": format!("{PROBE_KEY}-txn")}))?;
                    Ok(txn)
                });
            let txn = match staged {
                Ok(txn) => txn,
                Err(err) => return CrashRecoveryResult::fail(point, model.len(), 0, err.to_string()),
            };
            engine.service.crash();
            drop(txn);
            engine.crash()
        }
        CrashPoint::WithoutShutdownMarker => {
            let engine = engine.restart();
            if engine.service.recovery_report().clean_shutdown {
                return CrashRecoveryResult::fail(
                    point,
                    model.len(),
                    0,
                    "shutdown marker written despite the fault".into(),
                );
            }
            engine
        }
        _ => engine.crash(),
    };

    let collection = engine.collection(COLLECTION);
    let actual = collection.all().map(|docs| docs.len()).unwrap_or(0);
    match model.verify(&collection) {
        Ok(()) => CrashRecoveryResult::pass(point, model.len()),
        Err(err) => CrashRecoveryResult::fail(point, model.len(), actual, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::workload_strategy;
    use proptest::prelude::*;
    use vellum_core::Body;

    fn insert(key: &str) -> Op {
        Op::Insert {
            key: key.into(),
            body: Body::new(),
        }
    }

    #[test]
    fn every_crash_point_recovers_a_fixed_workload() {
        let mut ops: Vec<Op> = (0..30).map(|i| insert(&format!("k{i}"))).collect();
        ops.push(Op::Collect);
        ops.push(Op::Remove { key: "k3".into() });
        ops.push(Op::Update {
            key: "k4".into(),
            patch: serde_json::json!({"v": 1}).as_object().cloned().unwrap(),
        });

        let mut harness = CrashHarness::new();
        let results = harness.run_all(&ops);
        assert_eq!(results.len(), CrashPoint::ALL.len());
        assert!(harness.all_passed(), "{}", harness.summary());
        assert!(results.iter().all(|r| r.expected_documents == 29));
    }

    #[test]
    fn only_some_points_use_fail_points() {
        assert_eq!(CrashPoint::AfterCommit.fail_point(), None);
        assert_eq!(
            CrashPoint::DuringCollectorTransfer.fail_point(),
            Some(points::COLLECTOR_TRANSFER)
        );
    }

    #[test]
    fn empty_workload_passes() {
        let mut harness = CrashHarness::new();
        harness.run(&[], CrashPoint::AfterCommit);
        assert!(harness.all_passed());
        assert_eq!(harness.summary(), "1 runs passed");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn random_workloads_survive_every_crash_point(ops in workload_strategy(40)) {
            let mut harness = CrashHarness::new();
            harness.run_all(&ops);
            prop_assert!(harness.all_passed(), "{}", harness.summary());
        }
    }
}
