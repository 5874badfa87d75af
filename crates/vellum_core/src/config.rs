//! Engine, database, collection and transaction configuration.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the data directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Cap on live databases plus databases awaiting reclamation.
    pub max_databases: usize,

    /// Whether every commit syncs the WAL, regardless of options.
    pub sync_on_commit: bool,

    /// Appends that would grow the WAL past this size fail.
    pub max_wal_size: u64,

    /// Whether to run the collector on a background thread.
    pub background_collector: bool,

    /// Pause between background collector passes.
    pub collector_interval: Duration,

    /// Default wait for collection locks.
    pub lock_timeout: Duration,

    /// Dead-record ratio above which a datafile is compacted.
    pub compaction_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_databases: 128,
            sync_on_commit: false,
            max_wal_size: 256 * 1024 * 1024, // 256 MiB
            background_collector: true,
            collector_interval: Duration::from_millis(100),
            lock_timeout: Duration::from_secs(10),
            compaction_threshold: 0.5,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the data directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the database cap.
    #[must_use]
    pub const fn max_databases(mut self, value: usize) -> Self {
        self.max_databases = value;
        self
    }

    /// Sets whether every commit syncs the WAL.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the WAL size cap.
    #[must_use]
    pub const fn max_wal_size(mut self, size: u64) -> Self {
        self.max_wal_size = size;
        self
    }

    /// Sets whether the collector runs in the background.
    #[must_use]
    pub const fn background_collector(mut self, value: bool) -> Self {
        self.background_collector = value;
        self
    }

    /// Sets the pause between collector passes.
    #[must_use]
    pub const fn collector_interval(mut self, interval: Duration) -> Self {
        self.collector_interval = interval;
        self
    }

    /// Sets the default lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub const fn compaction_threshold(mut self, ratio: f64) -> Self {
        self.compaction_threshold = ratio;
        self
    }
}

/// How a database distributes its collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sharding {
    /// Collections are placed independently.
    #[default]
    Flexible,
    /// All collections follow one leader.
    Single,
}

/// Options given when creating a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseOptions {
    /// Number of copies of each collection.
    pub replication_factor: u32,
    /// Copies that must acknowledge a write (write concern).
    pub min_replication_factor: u32,
    /// Sharding mode.
    pub sharding: Sharding,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            replication_factor: 1,
            min_replication_factor: 1,
            sharding: Sharding::Flexible,
        }
    }
}

impl DatabaseOptions {
    /// Largest accepted replication factor.
    pub const MAX_REPLICATION_FACTOR: u32 = 10;

    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the replication factor.
    #[must_use]
    pub const fn replication_factor(mut self, value: u32) -> Self {
        self.replication_factor = value;
        self
    }

    /// Sets the write concern.
    #[must_use]
    pub const fn min_replication_factor(mut self, value: u32) -> Self {
        self.min_replication_factor = value;
        self
    }

    /// Sets the sharding mode.
    #[must_use]
    pub const fn sharding(mut self, value: Sharding) -> Self {
        self.sharding = value;
        self
    }

    /// Checks option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if the replication factor is outside
    /// `1..=10` or the write concern is outside `1..=replication_factor`.
    pub fn validate(&self) -> CoreResult<()> {
        if self.replication_factor == 0 || self.replication_factor > Self::MAX_REPLICATION_FACTOR {
            return Err(CoreError::validation(format!(
                "replicationFactor must be between 1 and {}, got {}",
                Self::MAX_REPLICATION_FACTOR,
                self.replication_factor
            )));
        }
        if self.min_replication_factor == 0 || self.min_replication_factor > self.replication_factor
        {
            return Err(CoreError::validation(format!(
                "writeConcern must be between 1 and replicationFactor ({}), got {}",
                self.replication_factor, self.min_replication_factor
            )));
        }
        Ok(())
    }
}

/// Options given when creating a collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Every commit touching the collection syncs the WAL.
    pub wait_for_sync: bool,
    /// System collections may use names starting with `_`.
    pub is_system: bool,
}

impl CollectionOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `wait_for_sync`.
    #[must_use]
    pub const fn wait_for_sync(mut self, value: bool) -> Self {
        self.wait_for_sync = value;
        self
    }

    /// Marks the collection as a system collection.
    #[must_use]
    pub const fn system(mut self, value: bool) -> Self {
        self.is_system = value;
        self
    }
}

/// Options for an explicit transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Collections read by the transaction.
    pub read: Vec<String>,
    /// Collections written with a shared lock.
    pub write: Vec<String>,
    /// Collections written with an exclusive lock.
    pub exclusive: Vec<String>,
    /// Overrides the engine's lock timeout.
    pub lock_timeout: Option<Duration>,
    /// Make every `n` operations durable as a sub-unit.
    pub intermediate_commit_count: Option<u64>,
    /// Sync the WAL on commit.
    pub wait_for_sync: bool,
}

impl TransactionOptions {
    /// Creates options with no collections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds read collections.
    #[must_use]
    pub fn read<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read.extend(names.into_iter().map(Into::into));
        self
    }

    /// Adds write collections.
    #[must_use]
    pub fn write<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write.extend(names.into_iter().map(Into::into));
        self
    }

    /// Adds exclusive collections.
    #[must_use]
    pub fn exclusive<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusive.extend(names.into_iter().map(Into::into));
        self
    }

    /// Sets the lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Sets the intermediate commit count.
    #[must_use]
    pub const fn intermediate_commit_count(mut self, count: u64) -> Self {
        self.intermediate_commit_count = Some(count);
        self
    }

    /// Sets `wait_for_sync`.
    #[must_use]
    pub const fn wait_for_sync(mut self, value: bool) -> Self {
        self.wait_for_sync = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.background_collector);
        assert!(!config.sync_on_commit);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_databases(4)
            .background_collector(false)
            .max_wal_size(1024);

        assert_eq!(config.max_databases, 4);
        assert!(!config.background_collector);
        assert_eq!(config.max_wal_size, 1024);
    }

    #[test]
    fn database_options_ranges() {
        assert!(DatabaseOptions::new().validate().is_ok());
        assert!(DatabaseOptions::new()
            .replication_factor(0)
            .validate()
            .is_err());
        assert!(DatabaseOptions::new()
            .replication_factor(2)
            .min_replication_factor(3)
            .validate()
            .is_err());
        assert!(DatabaseOptions::new()
            .replication_factor(3)
            .min_replication_factor(2)
            .sharding(Sharding::Single)
            .validate()
            .is_ok());
    }

    #[test]
    fn transaction_options_collect_names() {
        let options = TransactionOptions::new()
            .read(["a"])
            .write(vec!["b".to_string()])
            .exclusive(["c"])
            .intermediate_commit_count(1000);
        assert_eq!(options.read, vec!["a"]);
        assert_eq!(options.write, vec!["b"]);
        assert_eq!(options.exclusive, vec!["c"]);
        assert_eq!(options.intermediate_commit_count, Some(1000));
    }
}
