//! The commit path.
//!
//! Under the commit lock and the write locks of every involved collection:
//!
//! 1. check each staged operation against the committed state,
//! 2. apply it to the secondary indexes, remembering how to undo that,
//! 3. write the operations and the marker to the WAL as one batch,
//! 4. publish the new versions in the overlays and adjust counts,
//! 5. queue the logged operations for the collector.
//!
//! Nothing is visible to readers before step 4, and a failure before it
//! undoes step 2.

use super::{Expect, PendingOp};
use crate::collection::{CollectionData, CollectionState, OverlayEntry};
use crate::collector::QueuedOp;
use crate::document::Document;
use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::types::{SequenceNumber, TransactionId};
use crate::wal::{DocumentChange, DocumentOp, WalRecord};
use parking_lot::RwLockWriteGuard;
use std::collections::HashMap;
use std::sync::Arc;
use vellum_storage::fault::points;

struct IndexUndo {
    slot: usize,
    key: String,
    old: Option<Document>,
    new: Option<Document>,
}

fn rollback(guards: &mut [RwLockWriteGuard<'_, CollectionData>], undo: Vec<IndexUndo>) {
    for step in undo.into_iter().rev() {
        let _ = guards[step.slot]
            .indexes
            .update(&step.key, step.new.as_ref(), step.old.as_ref());
    }
}

fn check_expectation(state: &CollectionState, op: &PendingOp, existing: Option<&Document>) -> CoreResult<()> {
    match (op.expect, existing) {
        (Expect::Absent, Some(_)) => Err(CoreError::unique_violated(
            &state.name,
            format!(
                "unique constraint violated - in index primary of type primary over '_key'; conflicting key: {}",
                op.key
            ),
        )),
        (Expect::Rev(_), None) => Err(CoreError::document_not_found(&state.name, &op.key)),
        (Expect::Rev(expected), Some(doc)) if doc.rev != expected => Err(CoreError::RevisionConflict {
            key: op.key.clone(),
            expected,
            actual: doc.rev,
        }),
        _ => Ok(()),
    }
}

impl Engine {
    /// Validates `ops` and applies them to the indexes. Returns the count
    /// delta of each operation.
    fn prepare(
        states: &[Arc<CollectionState>],
        guards: &mut [RwLockWriteGuard<'_, CollectionData>],
        ops: &[PendingOp],
        slots: &[usize],
        undo: &mut Vec<IndexUndo>,
    ) -> CoreResult<Vec<i64>> {
        let mut current: HashMap<(usize, &str), Option<Document>> = HashMap::new();
        let mut deltas = Vec::with_capacity(ops.len());

        for (op, &slot) in ops.iter().zip(slots) {
            let state = &states[slot];
            let existing = match current.get(&(slot, op.key.as_str())) {
                Some(doc) => doc.clone(),
                None => {
                    let datafile = state.datafile.lock();
                    CollectionState::lookup(&guards[slot], &datafile, &op.key)?
                }
            };
            check_expectation(state, op, existing.as_ref())?;

            guards[slot]
                .indexes
                .update(&op.key, existing.as_ref(), op.doc.as_ref())
                .map_err(|detail| CoreError::unique_violated(&state.name, detail))?;
            deltas.push(match (existing.is_some(), op.doc.is_some()) {
                (false, true) => 1,
                (true, false) => -1,
                _ => 0,
            });
            undo.push(IndexUndo {
                slot,
                key: op.key.clone(),
                old: existing,
                new: op.doc.clone(),
            });
            current.insert((slot, op.key.as_str()), op.doc.clone());
        }
        Ok(deltas)
    }

    fn is_logged(&self, op: DocumentOp) -> bool {
        match op {
            DocumentOp::Insert => true,
            DocumentOp::Update => !self.faults.should_fail(points::UPDATE_DOCUMENT_NO_MARKER),
            DocumentOp::Remove => !self.faults.should_fail(points::REMOVE_DOCUMENT_NO_MARKER),
        }
    }

    /// Commits `ops` followed by `marker` as one unit.
    pub(crate) fn commit_batch(
        &self,
        txid: TransactionId,
        ops: &[PendingOp],
        marker: WalRecord,
        sync: bool,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        let _commit = self.commit_lock.lock();

        let mut states: Vec<Arc<CollectionState>> = Vec::new();
        for op in ops {
            if !states.iter().any(|s| s.id == op.collection.id) {
                states.push(Arc::clone(&op.collection));
            }
        }
        states.sort_by_key(|s| s.id);
        let slots: Vec<usize> = ops
            .iter()
            .map(|op| states.iter().position(|s| s.id == op.collection.id).unwrap_or(0))
            .collect();
        let mut guards: Vec<RwLockWriteGuard<'_, CollectionData>> =
            states.iter().map(|s| s.data.write()).collect();

        let mut undo = Vec::new();
        let deltas = match Self::prepare(&states, &mut guards, ops, &slots, &mut undo) {
            Ok(deltas) => deltas,
            Err(err) => {
                rollback(&mut guards, undo);
                return Err(err);
            }
        };

        let logged: Vec<bool> = ops.iter().map(|op| self.is_logged(op.op)).collect();
        let mut records: Vec<WalRecord> = ops
            .iter()
            .zip(&logged)
            .filter(|(_, logged)| **logged)
            .map(|(op, _)| {
                WalRecord::Document(DocumentChange {
                    txid,
                    database: op.collection.database,
                    collection: op.collection.id,
                    op: op.op,
                    key: op.key.clone(),
                    rev: op.rev,
                    body: op.body.clone(),
                })
            })
            .collect();

        if let Err(err) = self.faults.check(points::TRANSACTION_COMMIT_FAIL) {
            if !records.is_empty() {
                let _ = self.wal.append_batch(&records);
            }
            rollback(&mut guards, undo);
            return Err(err.into());
        }

        records.push(marker);
        let (first, _) = match self.wal.append_batch(&records) {
            Ok(range) => range,
            Err(err) => {
                rollback(&mut guards, undo);
                return Err(err);
            }
        };

        let count_commits = !self.faults.should_fail(points::DISABLE_COMMIT_COUNTS);
        let mut next_seq = first;
        let mut queued = Vec::with_capacity(ops.len());
        for (i, op) in ops.iter().enumerate() {
            let slot = slots[i];
            let seq = if logged[i] {
                let seq = next_seq;
                next_seq = next_seq.next();
                seq
            } else {
                SequenceNumber::default()
            };
            guards[slot].overlay.insert(
                op.key.clone(),
                OverlayEntry {
                    seq,
                    doc: op.doc.clone(),
                    logged: logged[i],
                },
            );
            let delta = if count_commits { deltas[i] } else { 0 };
            CollectionState::adjust_count(&states[slot].count, delta);
            if logged[i] {
                queued.push(QueuedOp {
                    seq,
                    collection: op.collection.id,
                    op: op.op,
                    key: op.key.clone(),
                    rev: op.rev,
                    body: op.body.clone(),
                    count_delta: delta,
                });
            }
        }
        self.queue.lock().extend(queued);
        drop(guards);

        if sync {
            self.wal.sync()?;
        }
        tracing::trace!(%txid, ops = ops.len(), "batch committed");
        Ok(())
    }
}
