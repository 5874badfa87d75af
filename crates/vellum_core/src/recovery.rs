//! Crash recovery.
//!
//! Recovery walks a fixed state machine:
//!
//! ```text
//! Crashed -> ScanningWal -> Replaying -> Consistent
//! ```
//!
//! While scanning, the WAL is read and grouped by transaction. A document
//! entry is committed when an intermediate-commit or commit marker of its
//! transaction follows it; everything else belongs to an aborted or
//! interrupted transaction and is discarded.
//!
//! Replay applies committed entries in sequence order on top of the
//! datafiles. Each collection skips entries at or below its watermark, the
//! larger of the datafile's applied sequence and the collected sequence in
//! the manifest, so replaying the same log twice changes nothing.

use crate::collection::{CollectionState, OverlayEntry};
use crate::collector::QueuedOp;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, Revision, SequenceNumber, TransactionId};
use crate::wal::{DocumentChange, DocumentOp, WalScan, WalRecord};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Recovery progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    /// Nothing has been read yet.
    Crashed,
    /// Reading and grouping the WAL.
    ScanningWal,
    /// Applying committed entries.
    Replaying,
    /// Every committed entry is applied.
    Consistent,
}

impl RecoveryState {
    /// Returns true if moving to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Crashed, Self::ScanningWal)
                | (Self::ScanningWal, Self::Replaying)
                | (Self::Replaying, Self::Consistent)
        )
    }
}

/// What recovery found and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Final state.
    pub state: RecoveryState,
    /// Entries read from the WAL.
    pub scanned: u64,
    /// Committed entries applied.
    pub replayed: u64,
    /// Committed entries already applied, or for missing collections.
    pub skipped: u64,
    /// Entries of aborted or interrupted transactions.
    pub discarded: u64,
    /// Bytes cut from a torn WAL tail.
    pub torn_bytes: u64,
    /// Last sequence found in the WAL.
    pub last_sequence: SequenceNumber,
    /// The previous process closed cleanly.
    pub clean_shutdown: bool,
}

impl Default for RecoveryReport {
    fn default() -> Self {
        Self {
            state: RecoveryState::Crashed,
            scanned: 0,
            replayed: 0,
            skipped: 0,
            discarded: 0,
            torn_bytes: 0,
            last_sequence: SequenceNumber::default(),
            clean_shutdown: false,
        }
    }
}

/// Committed entries in sequence order.
#[derive(Debug, Default)]
pub(crate) struct ReplayPlan {
    pub(crate) committed: Vec<(SequenceNumber, DocumentChange)>,
    /// Highest revision anywhere in the log, committed or not.
    pub(crate) max_revision: Revision,
}

/// Drives one recovery.
#[derive(Debug, Default)]
pub(crate) struct Recovery {
    report: RecoveryReport,
}

impl Recovery {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> RecoveryState {
        self.report.state
    }

    fn transition(&mut self, next: RecoveryState) -> CoreResult<()> {
        if !self.report.state.can_transition_to(next) {
            return Err(CoreError::invalid_operation(format!(
                "recovery cannot move from {:?} to {next:?}",
                self.report.state
            )));
        }
        self.report.state = next;
        Ok(())
    }

    /// Groups a scanned log into committed and discarded entries.
    pub(crate) fn scan(&mut self, scan: WalScan) -> CoreResult<ReplayPlan> {
        self.transition(RecoveryState::ScanningWal)?;
        self.report.scanned = scan.entries.len() as u64;
        self.report.torn_bytes = scan.torn_bytes;
        self.report.last_sequence = scan.last_sequence().unwrap_or_default();

        let mut plan = ReplayPlan::default();
        let mut marked: HashSet<TransactionId> = HashSet::new();
        for entry in scan.entries.into_iter().rev() {
            match entry.record {
                WalRecord::IntermediateCommit { txid } | WalRecord::Commit { txid } => {
                    marked.insert(txid);
                }
                WalRecord::Document(change) => {
                    plan.max_revision = plan.max_revision.max(change.rev);
                    if marked.contains(&change.txid) {
                        plan.committed.push((entry.sequence, change));
                    } else {
                        self.report.discarded += 1;
                    }
                }
                WalRecord::Abort { .. } | WalRecord::Checkpoint { .. } | WalRecord::Shutdown => {}
            }
        }
        plan.committed.reverse();
        Ok(plan)
    }

    /// Applies committed entries to the overlays and returns the operations
    /// the collector still has to move into datafiles.
    pub(crate) fn replay(
        &mut self,
        plan: ReplayPlan,
        collections: &BTreeMap<CollectionId, Arc<CollectionState>>,
        collected: SequenceNumber,
    ) -> CoreResult<Vec<QueuedOp>> {
        self.transition(RecoveryState::Replaying)?;
        let watermarks: BTreeMap<CollectionId, SequenceNumber> = collections
            .iter()
            .map(|(id, state)| (*id, state.datafile.lock().applied_seq().max(collected)))
            .collect();

        let mut queued = Vec::new();
        for (seq, change) in plan.committed {
            let Some(state) = collections.get(&change.collection) else {
                self.report.skipped += 1;
                continue;
            };
            if watermarks
                .get(&change.collection)
                .is_some_and(|watermark| seq <= *watermark)
            {
                self.report.skipped += 1;
                continue;
            }

            let mut data = state.data.write();
            let exists = {
                let datafile = state.datafile.lock();
                match data.overlay.get(&change.key) {
                    Some(entry) => entry.doc.is_some(),
                    None => datafile.contains(&change.key),
                }
            };

            let (doc, delta) = match change.op {
                DocumentOp::Insert if !exists => (
                    Some(Document::from_body_bytes(&change.key, change.rev, &change.body)?),
                    1,
                ),
                DocumentOp::Update if exists => (
                    Some(Document::from_body_bytes(&change.key, change.rev, &change.body)?),
                    0,
                ),
                DocumentOp::Remove if exists => (None, -1),
                DocumentOp::Insert => {
                    tracing::debug!(key = %change.key, %seq, "replay insert target present");
                    self.report.skipped += 1;
                    continue;
                }
                DocumentOp::Update | DocumentOp::Remove => {
                    tracing::debug!(key = %change.key, %seq, "replay target missing");
                    self.report.skipped += 1;
                    continue;
                }
            };

            data.overlay.insert(
                change.key.clone(),
                OverlayEntry {
                    seq,
                    doc,
                    logged: true,
                },
            );
            drop(data);
            CollectionState::adjust_count(&state.count, delta);
            queued.push(QueuedOp {
                seq,
                collection: change.collection,
                op: change.op,
                key: change.key,
                rev: change.rev,
                body: change.body,
                count_delta: delta,
            });
            self.report.replayed += 1;
        }
        Ok(queued)
    }

    /// Marks recovery complete.
    pub(crate) fn finish(mut self, clean_shutdown: bool) -> CoreResult<RecoveryReport> {
        self.transition(RecoveryState::Consistent)?;
        self.report.clean_shutdown = clean_shutdown;
        tracing::info!(
            scanned = self.report.scanned,
            replayed = self.report.replayed,
            skipped = self.report.skipped,
            discarded = self.report.discarded,
            clean_shutdown,
            "recovery complete"
        );
        Ok(self.report)
    }
}
