//! Named fault hooks.
//!
//! Production code asks a [`FaultController`] whether a named point should
//! fail and turns a positive answer into [`StorageError::FaultInjected`].
//! Engines are built with [`NoFaults`] unless a test hands them a
//! [`FailPoints`] switchboard.
//!
//! ```rust
//! use vellum_storage::fault::{points, FailPoints, FaultController};
//!
//! let faults = FailPoints::new();
//! assert!(faults.check(points::COLLECTOR_PROCESS_QUEUED).is_ok());
//!
//! faults.set_fail_at(points::COLLECTOR_PROCESS_QUEUED);
//! assert!(faults.check(points::COLLECTOR_PROCESS_QUEUED).is_err());
//!
//! faults.clear_all();
//! assert!(!faults.should_fail(points::COLLECTOR_PROCESS_QUEUED));
//! ```

use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;

/// Names of the fail points the engine checks.
pub mod points {
    /// Creating the temporary directory of a new database.
    pub const CREATE_DATABASE_TEMP_DIRECTORY: &str = "CreateDatabase::tempDirectory";
    /// Renaming a new database directory into place.
    pub const CREATE_DATABASE_RENAME_DIRECTORY: &str = "CreateDatabase::renameDirectory";
    /// Creating the temporary datafile of a new collection.
    pub const CREATE_COLLECTION_TEMP_DIRECTORY: &str = "CreateCollection::tempDirectory";
    /// Renaming a new collection datafile into place.
    pub const CREATE_COLLECTION_RENAME_DIRECTORY: &str = "CreateCollection::renameDirectory";
    /// Every WAL append fails as if the journal could not be created.
    pub const CREATE_JOURNAL: &str = "CreateJournalDocumentCollection";
    /// The collector stops before touching queued operations.
    pub const COLLECTOR_PROCESS_QUEUED: &str = "CollectorThreadProcessQueuedOperations";
    /// The collector fails after writing datafiles, before persisting its
    /// watermark.
    pub const COLLECTOR_TRANSFER: &str = "CollectorThreadTransfer";
    /// Commits stop adjusting document counts.
    pub const DISABLE_COMMIT_COUNTS: &str = "DisableCommitCounts";
    /// A commit fails after its operations are logged, before the marker.
    pub const TRANSACTION_COMMIT_FAIL: &str = "TransactionCommitFail";
    /// A single document write inside a transaction fails.
    pub const TRANSACTION_WRITE_DOCUMENT: &str = "TransactionWriteDocument";
    /// Removes are applied but not logged.
    pub const REMOVE_DOCUMENT_NO_MARKER: &str = "RemoveDocumentNoMarker";
    /// Updates are applied but not logged.
    pub const UPDATE_DOCUMENT_NO_MARKER: &str = "UpdateDocumentNoMarker";
    /// Closing skips the clean-shutdown marker.
    pub const WRITE_SHUTDOWN: &str = "LogfileManagerWriteShutdown";
    /// Replication requests randomly time out.
    pub const REPLICATION_RANDOM_TIMEOUT: &str = "replicateOperations_randomize_timeout";
    /// A follower-side replication apply batch fails.
    pub const REPLICATION_APPLY_BATCH: &str = "ReplicationApplyBatch";
}

/// Decides whether named fail points fire.
pub trait FaultController: Send + Sync + fmt::Debug {
    /// Returns true if `point` should fail now. Each call counts as one hit.
    fn should_fail(&self, point: &str) -> bool;

    /// Returns an injected-fault error if `point` fires.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FaultInjected`] when the point fires.
    fn check(&self, point: &str) -> StorageResult<()> {
        if self.should_fail(point) {
            Err(StorageError::fault(point))
        } else {
            Ok(())
        }
    }
}

/// The production controller: nothing ever fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultController for NoFaults {
    fn should_fail(&self, _point: &str) -> bool {
        false
    }
}

/// How an armed fail point behaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailMode {
    /// Fires on every hit.
    Always,
    /// Fires on the next hit, then disarms.
    Once,
    /// Passes `n - 1` hits, then fires on hit `n` and every later hit.
    FromHit(u64),
    /// Fires with the given probability in `[0.0, 1.0]`.
    Probability(f64),
}

#[derive(Debug)]
struct Armed {
    mode: FailMode,
    hits: u64,
    fired: u64,
    disarmed: bool,
}

/// A switchboard of armed fail points.
///
/// Randomised modes draw from a seeded generator so a failing run can be
/// replayed with the same seed.
pub struct FailPoints {
    armed: RwLock<HashMap<String, Armed>>,
    rng: Mutex<StdRng>,
    seed: u64,
}

impl FailPoints {
    /// Default seed for [`FailPoints::new`].
    pub const DEFAULT_SEED: u64 = 0x5EED_F00D;

    /// Creates a switchboard with nothing armed.
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(Self::DEFAULT_SEED)
    }

    /// Creates a switchboard whose random modes use `seed`.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            armed: RwLock::new(HashMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            seed,
        }
    }

    /// Returns the random seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Arms `point` to fail on every hit.
    pub fn set_fail_at(&self, point: &str) {
        self.set_fail_with(point, FailMode::Always);
    }

    /// Arms `point` with `mode`, resetting its hit counters.
    pub fn set_fail_with(&self, point: &str, mode: FailMode) {
        tracing::debug!(point, ?mode, "arming fail point");
        self.armed.write().insert(
            point.to_string(),
            Armed {
                mode,
                hits: 0,
                fired: 0,
                disarmed: false,
            },
        );
    }

    /// Disarms `point`.
    pub fn clear_fail_at(&self, point: &str) {
        self.armed.write().remove(point);
    }

    /// Disarms every point.
    pub fn clear_all(&self) {
        self.armed.write().clear();
    }

    /// Returns true if `point` is armed.
    #[must_use]
    pub fn is_armed(&self, point: &str) -> bool {
        self.armed
            .read()
            .get(point)
            .is_some_and(|armed| !armed.disarmed)
    }

    /// Returns how often `point` fired since it was armed. A [`FailMode::Once`]
    /// point keeps its count after it disarms.
    #[must_use]
    pub fn fired(&self, point: &str) -> u64 {
        self.armed.read().get(point).map_or(0, |armed| armed.fired)
    }

    /// Returns the armed point names, sorted.
    #[must_use]
    pub fn armed_points(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .armed
            .read()
            .iter()
            .filter(|(_, armed)| !armed.disarmed)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for FailPoints {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FailPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailPoints")
            .field("armed", &self.armed_points())
            .field("seed", &self.seed)
            .finish()
    }
}

impl FaultController for FailPoints {
    fn should_fail(&self, point: &str) -> bool {
        if self.armed.read().is_empty() {
            return false;
        }
        let mut armed = self.armed.write();
        let Some(entry) = armed.get_mut(point).filter(|entry| !entry.disarmed) else {
            return false;
        };
        entry.hits += 1;
        let fire = match entry.mode {
            FailMode::Always | FailMode::Once => true,
            FailMode::FromHit(n) => entry.hits >= n,
            FailMode::Probability(p) => self.rng.lock().gen_bool(p.clamp(0.0, 1.0)),
        };
        if fire {
            entry.fired += 1;
            tracing::debug!(point, hit = entry.hits, "fail point fired");
            if entry.mode == FailMode::Once {
                entry.disarmed = true;
            }
        }
        fire
    }
}
