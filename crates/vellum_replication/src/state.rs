//! Sync state machine and bookkeeping.

use crate::config::SyncMode;
use std::time::{Duration, Instant};

/// Where a replication engine is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// Copying a full dump into an empty follower.
    Dumping,
    /// Comparing chunk or bucket summaries with the leader.
    Comparing,
    /// Applying fetched documents and removals.
    Applying,
    /// Waiting before retrying a leader request.
    RetryWait,
    /// Last sync converged.
    Synced,
    /// Last sync failed.
    Error,
}

impl SyncState {
    /// Returns true while a sync is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Dumping | SyncState::Comparing | SyncState::Applying | SyncState::RetryWait
        )
    }

    /// Returns true if a new sync may start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }
}

/// What one differencing pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Difference {
    /// Keys to fetch from the leader.
    pub fetch: Vec<String>,
    /// Keys to remove locally.
    pub remove: Vec<String>,
}

impl Difference {
    /// Returns true if nothing needs doing.
    pub fn is_empty(&self) -> bool {
        self.fetch.is_empty() && self.remove.is_empty()
    }
}

/// Outcome of one `sync` call.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Mode actually used for comparison.
    pub mode: SyncMode,
    /// Whether the initial copy came from a full dump.
    pub dumped: bool,
    /// Compare-and-apply rounds run, the final clean one included.
    pub rounds: u32,
    /// Documents written locally.
    pub fetched: u64,
    /// Documents removed locally.
    pub removed: u64,
    /// Leader requests retried.
    pub retries: u64,
    /// Apply batches that failed and were redone in a later round.
    pub failed_batches: u64,
    /// Whether the last round found no difference.
    pub converged: bool,
    /// Duration of the sync.
    pub duration: Duration,
}

impl SyncReport {
    pub(crate) fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            dumped: false,
            rounds: 0,
            fetched: 0,
            removed: 0,
            retries: 0,
            failed_batches: 0,
            converged: false,
            duration: Duration::ZERO,
        }
    }
}

/// Totals across every sync of an engine.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Syncs that finished without error.
    pub syncs_completed: u64,
    /// Syncs that returned an error.
    pub syncs_failed: u64,
    /// Documents written locally.
    pub documents_fetched: u64,
    /// Documents removed locally.
    pub documents_removed: u64,
    /// Leader requests retried.
    pub retries: u64,
    /// Times the leader lacked revision support and keys mode was used.
    pub fallbacks: u64,
    /// Last successful sync.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

impl SyncStats {
    pub(crate) fn record(&mut self, report: &SyncReport) {
        self.syncs_completed += 1;
        self.documents_fetched += report.fetched;
        self.documents_removed += report.removed;
        self.retries += report.retries;
        self.last_sync_time = Some(Instant::now());
        self.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, message: String, retries: u64) {
        self.syncs_failed += 1;
        self.retries += retries;
        self.last_error = Some(message);
    }
}
