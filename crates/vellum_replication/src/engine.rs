//! The follower-side replication engine.
//!
//! A sync brings one local collection to exactly the leader's set of
//! `(key, revision, body)` triples:
//!
//! 1. An empty follower first copies a full dump, page by page, with the
//!    page size growing by a quarter per page up to a cap.
//! 2. Then rounds of compare-and-apply run until a round finds nothing to
//!    do. Comparison uses revision buckets or key chunks; only mismatching
//!    buckets or chunks are listed entry by entry.
//! 3. Differences are applied in exclusive transactions with intermediate
//!    commits. A failed apply batch is logged and repaired by the next
//!    round.
//!
//! Every leader request is retried with backoff. The sync fails only when
//! the leader stays unreachable, when leader and follower disagree on the
//! body of the same key at the same revision, or on a local error no later
//! round could repair.

use crate::config::{SyncConfig, SyncMode};
use crate::error::{ReplicationError, ReplicationResult};
use crate::protocol::{
    bucket_of, chunk_hash, revision_buckets, Entry, KeyChunk, ReplicationRequest,
    ReplicationResponse, WireDocument,
};
use crate::state::{Difference, SyncReport, SyncState, SyncStats};
use crate::transport::ReplicationTransport;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use vellum_core::{Collection, CoreError, Database, TransactionOptions};
use vellum_storage::fault::points;
use vellum_storage::{FaultController, NoFaults};

/// Replicates collections from one leader.
pub struct ReplicationEngine<T: ReplicationTransport> {
    config: SyncConfig,
    transport: T,
    faults: Arc<dyn FaultController>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

/// Names one collection on both sides.
struct Target<'a> {
    database: &'a str,
    collection: &'a str,
}

impl<T: ReplicationTransport> ReplicationEngine<T> {
    /// Creates an engine talking to the leader through `transport`.
    pub fn new(config: SyncConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            faults: Arc::new(NoFaults),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Consults `faults` for the follower-side apply fail point.
    pub fn with_faults(mut self, faults: Arc<dyn FaultController>) -> Self {
        self.faults = faults;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the accumulated stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Asks a running sync to stop at the next request or batch.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> ReplicationResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(ReplicationError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Brings `collection` in `follower` to the leader's content of the
    /// collection with the same name in the database with the same name.
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::LeaderUnreachable`] if a request failed on
    ///   every attempt.
    /// - [`ReplicationError::Conflict`] if both sides hold the same key and
    ///   revision with different bodies.
    /// - [`ReplicationError::Busy`] if another sync is running.
    /// - Local engine errors that retrying cannot fix.
    pub fn sync(&self, follower: &Database, collection: &str) -> ReplicationResult<SyncReport> {
        {
            let mut state = self.state.write();
            if !state.can_start_sync() {
                return Err(ReplicationError::Busy);
            }
            *state = SyncState::Comparing;
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let start = Instant::now();
        let initial_mode = match self.config.mode {
            SyncMode::Keys => SyncMode::Keys,
            SyncMode::Auto | SyncMode::Revisions => SyncMode::Revisions,
        };
        let mut report = SyncReport::new(initial_mode);
        let target = Target {
            database: follower.name(),
            collection,
        };

        let result = self.run(follower, &target, &mut report);
        report.duration = start.elapsed();

        match result {
            Ok(()) => {
                self.set_state(SyncState::Synced);
                self.stats.write().record(&report);
                tracing::info!(
                    database = target.database,
                    collection,
                    mode = ?report.mode,
                    rounds = report.rounds,
                    fetched = report.fetched,
                    removed = report.removed,
                    converged = report.converged,
                    "sync finished"
                );
                Ok(report)
            }
            Err(err) => {
                self.set_state(SyncState::Error);
                self.stats
                    .write()
                    .record_failure(err.to_string(), report.retries);
                tracing::warn!(database = target.database, collection, error = %err, "sync failed");
                Err(err)
            }
        }
    }

    fn run(
        &self,
        follower: &Database,
        target: &Target<'_>,
        report: &mut SyncReport,
    ) -> ReplicationResult<()> {
        let local = follower.collection(target.collection)?;

        let leader_count = match self.call(
            &ReplicationRequest::Inventory {
                database: target.database.to_string(),
                collection: target.collection.to_string(),
            },
            report,
        )? {
            ReplicationResponse::Inventory { count, .. } => count,
            other => return Err(unexpected("inventory", &other)),
        };

        if leader_count > 0 && local.key_revisions()?.is_empty() {
            self.set_state(SyncState::Dumping);
            self.dump(follower, target, report)?;
            report.dumped = true;
        }

        for round in 1..=self.config.max_rounds {
            self.check_cancelled()?;
            report.rounds = round;
            self.set_state(SyncState::Comparing);

            let diff = self.difference(&local, target, report)?;
            tracing::debug!(
                round,
                fetch = diff.fetch.len(),
                remove = diff.remove.len(),
                "sync round compared"
            );
            if diff.is_empty() {
                report.converged = true;
                return Ok(());
            }

            self.set_state(SyncState::Applying);
            self.apply(follower, target, diff, report)?;
        }

        tracing::warn!(
            collection = target.collection,
            rounds = self.config.max_rounds,
            "sync stopped before converging"
        );
        Ok(())
    }

    /// Sends a request, retrying transient failures with backoff.
    fn call(
        &self,
        request: &ReplicationRequest,
        report: &mut SyncReport,
    ) -> ReplicationResult<ReplicationResponse> {
        let retry = &self.config.retry;
        let phase = self.state();
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                self.set_state(SyncState::RetryWait);
                let delay = retry.delay_for_attempt(attempt);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                report.retries += 1;
                self.set_state(phase);
            }
            self.check_cancelled()?;

            match self
                .transport
                .call(request)
                .and_then(ReplicationResponse::into_result)
            {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => {
                    tracing::debug!(request = request.name(), attempt, error = %err, "retrying");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(ReplicationError::LeaderUnreachable {
            attempts: retry.max_attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn dump(
        &self,
        follower: &Database,
        target: &Target<'_>,
        report: &mut SyncReport,
    ) -> ReplicationResult<()> {
        let mut after: Option<String> = None;
        let mut chunk = self.config.initial_dump_chunk;
        loop {
            self.check_cancelled()?;
            let request = ReplicationRequest::Dump {
                database: target.database.to_string(),
                collection: target.collection.to_string(),
                after: after.clone(),
                limit: chunk,
            };
            let (documents, has_more) = match self.call(&request, report)? {
                ReplicationResponse::Dump {
                    documents,
                    has_more,
                } => (documents, has_more),
                other => return Err(unexpected("dump", &other)),
            };
            let Some(last) = documents.last() else {
                break;
            };
            after = Some(last.key.clone());
            tracing::debug!(documents = documents.len(), chunk, "applying dump page");
            self.apply_batch(follower, target, &[], documents, report)?;
            if !has_more {
                break;
            }
            chunk = self.config.next_dump_chunk(chunk);
        }
        Ok(())
    }

    fn difference(
        &self,
        local: &Collection,
        target: &Target<'_>,
        report: &mut SyncReport,
    ) -> ReplicationResult<Difference> {
        let mut entries: Vec<Entry> = local.all()?.iter().map(Entry::of).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        if report.mode == SyncMode::Revisions {
            match self.revision_difference(&entries, target, report) {
                Err(ReplicationError::NotImplemented { request })
                    if self.config.mode == SyncMode::Auto =>
                {
                    tracing::info!(request, "leader lacks revision trees, using key chunks");
                    report.mode = SyncMode::Keys;
                    self.stats.write().fallbacks += 1;
                }
                other => return other,
            }
        }
        self.key_difference(&entries, target, report)
    }

    fn key_difference(
        &self,
        local: &[Entry],
        target: &Target<'_>,
        report: &mut SyncReport,
    ) -> ReplicationResult<Difference> {
        let chunks = match self.call(
            &ReplicationRequest::KeyChunks {
                database: target.database.to_string(),
                collection: target.collection.to_string(),
                chunk_size: self.config.chunk_size,
            },
            report,
        )? {
            ReplicationResponse::KeyChunks { chunks } => chunks,
            other => return Err(unexpected("key chunks", &other)),
        };

        let mut diff = Difference::default();
        for entry in local {
            if !covered(&chunks, &entry.key) {
                diff.remove.push(entry.key.clone());
            }
        }

        for chunk in &chunks {
            let from = local.partition_point(|e| e.key < chunk.low);
            let to = local.partition_point(|e| e.key <= chunk.high);
            let mine = &local[from..to];
            if mine.len() as u64 == chunk.count && chunk_hash(mine) == chunk.hash {
                continue;
            }
            let theirs = self.list(
                ReplicationRequest::KeysInRange {
                    database: target.database.to_string(),
                    collection: target.collection.to_string(),
                    low: chunk.low.clone(),
                    high: chunk.high.clone(),
                },
                report,
            )?;
            compare(&theirs, mine, &mut diff)?;
        }
        Ok(finish(diff))
    }

    fn revision_difference(
        &self,
        local: &[Entry],
        target: &Target<'_>,
        report: &mut SyncReport,
    ) -> ReplicationResult<Difference> {
        let bucket_count = self.config.bucket_count;
        let theirs = match self.call(
            &ReplicationRequest::RevisionTree {
                database: target.database.to_string(),
                collection: target.collection.to_string(),
                bucket_count,
            },
            report,
        )? {
            ReplicationResponse::RevisionTree { buckets } => buckets,
            other => return Err(unexpected("revision tree", &other)),
        };
        let mine = revision_buckets(local, bucket_count);
        if theirs.len() != mine.len() {
            return Err(ReplicationError::Protocol(format!(
                "asked for {} buckets, got {}",
                mine.len(),
                theirs.len()
            )));
        }

        let mismatched: Vec<u32> = mine
            .iter()
            .zip(&theirs)
            .filter(|(a, b)| a.count != b.count || a.hash != b.hash)
            .map(|(a, _)| a.index)
            .collect();
        if mismatched.is_empty() {
            return Ok(Difference::default());
        }

        let listed = self.list(
            ReplicationRequest::RevisionsInBuckets {
                database: target.database.to_string(),
                collection: target.collection.to_string(),
                bucket_count,
                buckets: mismatched.clone(),
            },
            report,
        )?;
        let wanted: HashSet<u32> = mismatched.into_iter().collect();
        let mine: Vec<Entry> = local
            .iter()
            .filter(|e| wanted.contains(&bucket_of(e.rev, bucket_count)))
            .cloned()
            .collect();

        let mut diff = Difference::default();
        compare(&listed, &mine, &mut diff)?;
        Ok(finish(diff))
    }

    fn list(
        &self,
        request: ReplicationRequest,
        report: &mut SyncReport,
    ) -> ReplicationResult<Vec<Entry>> {
        match self.call(&request, report)? {
            ReplicationResponse::Entries { entries } => Ok(entries),
            other => Err(unexpected(request.name(), &other)),
        }
    }

    fn apply(
        &self,
        follower: &Database,
        target: &Target<'_>,
        diff: Difference,
        report: &mut SyncReport,
    ) -> ReplicationResult<()> {
        let batch = self.config.fetch_batch_size;
        for keys in diff.remove.chunks(batch) {
            self.check_cancelled()?;
            self.apply_batch(follower, target, keys, Vec::new(), report)?;
        }
        for keys in diff.fetch.chunks(batch) {
            self.check_cancelled()?;
            let documents = match self.call(
                &ReplicationRequest::Documents {
                    database: target.database.to_string(),
                    collection: target.collection.to_string(),
                    keys: keys.to_vec(),
                },
                report,
            )? {
                ReplicationResponse::Documents { documents } => documents,
                other => return Err(unexpected("documents", &other)),
            };
            self.apply_batch(follower, target, &[], documents, report)?;
        }
        Ok(())
    }

    /// Applies one batch in an exclusive transaction. Failures a later
    /// round can repair are counted and swallowed.
    fn apply_batch(
        &self,
        follower: &Database,
        target: &Target<'_>,
        removals: &[String],
        documents: Vec<WireDocument>,
        report: &mut SyncReport,
    ) -> ReplicationResult<()> {
        match self.write_batch(follower, target.collection, removals, documents) {
            Ok((removed, written)) => {
                report.removed += removed;
                report.fetched += written;
                Ok(())
            }
            Err(err) if err.is_local_apply_failure() => {
                report.failed_batches += 1;
                tracing::warn!(
                    collection = target.collection,
                    error = %err,
                    "apply batch failed, next round retries"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn write_batch(
        &self,
        follower: &Database,
        collection: &str,
        removals: &[String],
        documents: Vec<WireDocument>,
    ) -> ReplicationResult<(u64, u64)> {
        let mut txn = follower.begin(
            TransactionOptions::new()
                .exclusive([collection])
                .intermediate_commit_count(self.config.intermediate_commit_count),
        )?;

        let mut removed = 0;
        for key in removals {
            if txn.remove_replica(collection, key)? {
                removed += 1;
            }
        }
        let mut written = 0;
        for doc in documents {
            txn.put_replica(collection, doc.into_document()?)?;
            written += 1;
        }

        if let Err(err) = self.faults.check(points::REPLICATION_APPLY_BATCH) {
            txn.abort()?;
            return Err(CoreError::from(err).into());
        }
        txn.commit()?;
        Ok((removed, written))
    }
}

impl<T: ReplicationTransport> std::fmt::Debug for ReplicationEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn unexpected(what: &str, response: &ReplicationResponse) -> ReplicationError {
    ReplicationError::Protocol(format!("expected {what} answer, got {response:?}"))
}

/// Whether `key` lies inside one of the leader's chunks.
fn covered(chunks: &[KeyChunk], key: &str) -> bool {
    let idx = chunks.partition_point(|c| c.low.as_str() <= key);
    idx > 0 && key <= chunks[idx - 1].high.as_str()
}

/// Records what turns `mine` into `theirs`. Both cover the same range.
fn compare(theirs: &[Entry], mine: &[Entry], diff: &mut Difference) -> ReplicationResult<()> {
    let local: HashMap<&str, &Entry> = mine.iter().map(|e| (e.key.as_str(), e)).collect();
    let remote: HashSet<&str> = theirs.iter().map(|e| e.key.as_str()).collect();

    for entry in theirs {
        match local.get(entry.key.as_str()) {
            Some(own) if own.rev == entry.rev => {
                if own.body_hash != entry.body_hash {
                    return Err(ReplicationError::Conflict {
                        key: entry.key.clone(),
                        rev: entry.rev,
                    });
                }
            }
            _ => diff.fetch.push(entry.key.clone()),
        }
    }
    for entry in mine {
        if !remote.contains(entry.key.as_str()) {
            diff.remove.push(entry.key.clone());
        }
    }
    Ok(())
}

/// Drops duplicate keys and removals of keys that will be fetched.
fn finish(mut diff: Difference) -> Difference {
    diff.fetch.sort();
    diff.fetch.dedup();
    diff.remove.sort();
    diff.remove.dedup();
    diff.remove
        .retain(|key| diff.fetch.binary_search(key).is_err());
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, rev: u64, body: u8) -> Entry {
        Entry {
            key: key.into(),
            rev,
            body_hash: [body; 32],
        }
    }

    #[test]
    fn compare_finds_new_changed_and_gone_keys() {
        let theirs = vec![entry("a", 1, 1), entry("b", 5, 2), entry("c", 3, 3)];
        let mine = vec![entry("a", 1, 1), entry("b", 4, 9), entry("d", 2, 4)];
        let mut diff = Difference::default();
        compare(&theirs, &mine, &mut diff).unwrap();
        assert_eq!(diff.fetch, ["b", "c"]);
        assert_eq!(diff.remove, ["d"]);
    }

    #[test]
    fn same_revision_different_body_is_a_conflict() {
        let theirs = vec![entry("a", 7, 1)];
        let mine = vec![entry("a", 7, 2)];
        let err = compare(&theirs, &mine, &mut Difference::default()).unwrap_err();
        assert!(matches!(err, ReplicationError::Conflict { rev: 7, .. }));
    }

    #[test]
    fn fetched_keys_are_not_removed() {
        let diff = finish(Difference {
            fetch: vec!["k".into(), "k".into()],
            remove: vec!["k".into(), "x".into()],
        });
        assert_eq!(diff.fetch, ["k"]);
        assert_eq!(diff.remove, ["x"]);
    }

    #[test]
    fn keys_between_chunks_are_uncovered() {
        let chunk = |low: &str, high: &str| KeyChunk {
            low: low.into(),
            high: high.into(),
            count: 1,
            hash: [0; 32],
        };
        let chunks = vec![chunk("b", "d"), chunk("g", "k")];
        assert!(!covered(&chunks, "a"));
        assert!(covered(&chunks, "b"));
        assert!(covered(&chunks, "c"));
        assert!(!covered(&chunks, "e"));
        assert!(covered(&chunks, "k"));
        assert!(!covered(&chunks, "z"));
        assert!(!covered(&[], "a"));
    }
}
