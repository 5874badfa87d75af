//! The collector moves committed WAL entries into collection datafiles.
//!
//! A pass:
//!
//! 1. drains the queue of committed operations (in sequence order),
//! 2. applies them to datafiles and syncs those files,
//! 3. persists the collected watermark and counts in the manifest,
//! 4. evicts collected entries from the overlays,
//! 5. empties the WAL once nothing uncollected is left,
//! 6. reclaims dropped collections and databases,
//! 7. compacts datafiles with many dead records.
//!
//! A failure anywhere before step 3 puts the drained operations back at
//! the front of the queue. Datafiles ignore sequences they already hold, so
//! the retry applies every operation exactly once.

use crate::collection::CollectionState;
use crate::engine::Engine;
use crate::error::CoreResult;
use crate::types::{CollectionId, Revision, SequenceNumber};
use crate::wal::{DocumentOp, WalRecord};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use vellum_storage::fault::points;

/// Datafiles are only compacted once they carry at least this many dead
/// records.
const MIN_DEAD_RECORDS: u64 = 32;

/// A committed operation waiting to be collected.
#[derive(Debug, Clone)]
pub(crate) struct QueuedOp {
    pub(crate) seq: SequenceNumber,
    pub(crate) collection: CollectionId,
    pub(crate) op: DocumentOp,
    pub(crate) key: String,
    pub(crate) rev: Revision,
    pub(crate) body: Vec<u8>,
    pub(crate) count_delta: i64,
}

/// Outcome of one collector pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// Operations written to datafiles.
    pub applied: usize,
    /// Operations for dropped collections or already applied sequences.
    pub skipped: usize,
    /// Overlay entries released.
    pub evicted: usize,
    /// Collected watermark after the pass.
    pub collected: SequenceNumber,
    /// The WAL was emptied.
    pub wal_reset: bool,
    /// Collections and databases reclaimed.
    pub reclaimed: usize,
    /// Datafiles compacted.
    pub compacted: usize,
}

impl Engine {
    fn live_collections(&self) -> BTreeMap<CollectionId, Arc<CollectionState>> {
        self.catalog
            .read()
            .collections
            .iter()
            .map(|(id, state)| (*id, Arc::clone(state)))
            .collect()
    }

    /// Runs one collector pass.
    pub(crate) fn collect_once(&self) -> CoreResult<CollectStats> {
        let _collect = self.collect_lock.lock();
        self.faults.check(points::COLLECTOR_PROCESS_QUEUED)?;

        let batch: Vec<QueuedOp> = self.queue.lock().drain(..).collect();
        let collections = self.live_collections();
        let mut stats = match self.transfer(&batch, &collections) {
            Ok(stats) => stats,
            Err(err) => {
                let mut queue = self.queue.lock();
                for op in batch.into_iter().rev() {
                    queue.push_front(op);
                }
                return Err(err);
            }
        };

        for state in collections.values() {
            stats.evicted += state.data.write().evict(stats.collected);
        }

        stats.wal_reset = self.reset_wal_if_collected(stats.collected)?;
        stats.reclaimed = self.cleanup_locked()?;
        stats.compacted = self.compact_locked(&collections)?;

        tracing::debug!(
            applied = stats.applied,
            skipped = stats.skipped,
            evicted = stats.evicted,
            collected = %stats.collected,
            wal_reset = stats.wal_reset,
            "collector pass"
        );
        Ok(stats)
    }

    fn transfer(
        &self,
        batch: &[QueuedOp],
        collections: &BTreeMap<CollectionId, Arc<CollectionState>>,
    ) -> CoreResult<CollectStats> {
        let mut stats = CollectStats::default();
        let mut touched = BTreeSet::new();
        let mut deltas: BTreeMap<CollectionId, i64> = BTreeMap::new();

        for op in batch {
            let Some(state) = collections.get(&op.collection).filter(|s| !s.is_dropped()) else {
                stats.skipped += 1;
                continue;
            };
            let mut datafile = state.datafile.lock();
            let applied = match op.op {
                DocumentOp::Insert | DocumentOp::Update => {
                    datafile.apply_put(op.seq, &op.key, op.rev, &op.body)?
                }
                DocumentOp::Remove => datafile.apply_remove(op.seq, &op.key, op.rev)?,
            };
            if applied {
                stats.applied += 1;
            } else {
                stats.skipped += 1;
            }
            touched.insert(op.collection);
            *deltas.entry(op.collection).or_default() += op.count_delta;
        }

        for id in &touched {
            if let Some(state) = collections.get(id) {
                state.datafile.lock().sync()?;
            }
        }
        self.faults.check(points::COLLECTOR_TRANSFER)?;

        let mut manifest = self.manifest.lock();
        let collected = batch
            .iter()
            .map(|op| op.seq)
            .max()
            .unwrap_or(manifest.collected_seq)
            .max(manifest.collected_seq);
        let mut counts = Vec::with_capacity(deltas.len());
        for (id, delta) in &deltas {
            let Some(state) = collections.get(id) else {
                continue;
            };
            let count = CollectionState::apply_delta(
                state.collected_count.load(Ordering::Acquire),
                *delta,
            );
            if let Some(meta) = manifest.collection_mut(*id) {
                meta.count = count;
            }
            counts.push((Arc::clone(state), count));
        }
        manifest.collected_seq = collected;
        manifest.max_revision = manifest.max_revision.max(self.clock.last());
        self.dir.save_manifest(&manifest)?;
        drop(manifest);

        for (state, count) in counts {
            state.collected_count.store(count, Ordering::Release);
        }
        stats.collected = collected;
        Ok(stats)
    }

    fn reset_wal_if_collected(&self, collected: SequenceNumber) -> CoreResult<bool> {
        let _commit = self.commit_lock.lock();
        let last = self.wal.last_sequence();
        if !self.queue.lock().is_empty()
            || self.wal.size() == 0
            || last.as_u64() == self.last_checkpoint.load(Ordering::Acquire)
        {
            return Ok(false);
        }

        {
            let mut manifest = self.manifest.lock();
            manifest.last_seq = last;
            manifest.max_revision = manifest.max_revision.max(self.clock.last());
            self.dir.save_manifest(&manifest)?;
        }
        self.wal.reset()?;
        let checkpoint = self.wal.append(&WalRecord::Checkpoint { collected })?;
        self.last_checkpoint
            .store(checkpoint.as_u64(), Ordering::Release);
        tracing::debug!(%last, "WAL fully collected and emptied");
        Ok(true)
    }

    fn compact_locked(
        &self,
        collections: &BTreeMap<CollectionId, Arc<CollectionState>>,
    ) -> CoreResult<usize> {
        let mut compacted = 0;
        for state in collections.values().filter(|s| !s.is_dropped()) {
            let mut datafile = state.datafile.lock();
            if datafile.dead_records() >= MIN_DEAD_RECORDS
                && datafile.dead_ratio() > self.config.compaction_threshold
            {
                self.dir
                    .compact_datafile(state.database, state.id, &mut datafile)?;
                compacted += 1;
            }
        }
        Ok(compacted)
    }
}

#[derive(Debug, Default)]
struct SignalState {
    wake: bool,
    stop: bool,
}

#[derive(Debug, Default)]
struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

/// Handle of the background collector thread.
#[derive(Debug)]
pub(crate) struct CollectorThread {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl CollectorThread {
    pub(crate) fn spawn(engine: Weak<Engine>, interval: Duration) -> CoreResult<Self> {
        let signal = Arc::new(Signal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("vellum-collector".into())
            .spawn(move || run(&engine, &thread_signal, interval))?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub(crate) fn wake(&self) {
        self.signal.state.lock().wake = true;
        self.signal.cond.notify_one();
    }

    pub(crate) fn stop(mut self) {
        self.signal.state.lock().stop = true;
        self.signal.cond.notify_one();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(engine: &Weak<Engine>, signal: &Signal, interval: Duration) {
    loop {
        {
            let mut state = signal.state.lock();
            if !state.stop && !state.wake {
                signal.cond.wait_for(&mut state, interval);
            }
            if state.stop {
                return;
            }
            state.wake = false;
        }

        let Some(engine) = engine.upgrade() else {
            return;
        };
        if engine.is_closed() {
            return;
        }
        match engine.collect_once() {
            Ok(_) => {}
            Err(err) if err.is_corruption() => {
                tracing::error!(error = %err, "collector halted");
                engine.halted.store(true, Ordering::Release);
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "collector pass failed, retrying");
            }
        }
    }
}
