//! Configuration for replication.

use rand::Rng;
use std::time::Duration;

/// How the follower compares its collection with the leader's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Revision buckets, falling back to key chunks if the leader is too old.
    #[default]
    Auto,
    /// Sorted key chunks ("old" format).
    Keys,
    /// Revision buckets ("new" format).
    Revisions,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Comparison mode.
    pub mode: SyncMode,
    /// Keys per chunk in keys mode.
    pub chunk_size: u64,
    /// Number of revision buckets in revisions mode.
    pub bucket_count: u32,
    /// Documents fetched per request.
    pub fetch_batch_size: usize,
    /// First dump chunk size for an empty follower.
    pub initial_dump_chunk: u64,
    /// Largest dump chunk size.
    pub max_dump_chunk: u64,
    /// Upper bound on compare-and-apply rounds per sync.
    pub max_rounds: u32,
    /// Intermediate commit count for apply transactions.
    pub intermediate_commit_count: u64,
    /// Retry configuration for leader requests.
    pub retry: RetryConfig,
    /// Interval between syncs of a [`ReplicationTask`](crate::ReplicationTask).
    pub sync_interval: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default sizes.
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            chunk_size: 500,
            bucket_count: 64,
            fetch_batch_size: 1000,
            initial_dump_chunk: 1000,
            max_dump_chunk: 16_384,
            max_rounds: 16,
            intermediate_commit_count: 10_000,
            retry: RetryConfig::default(),
            sync_interval: Duration::from_secs(5),
        }
    }

    /// Sets the key chunk size.
    pub fn with_chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sets the revision bucket count.
    pub fn with_bucket_count(mut self, count: u32) -> Self {
        self.bucket_count = count.max(1);
        self
    }

    /// Sets the fetch batch size.
    pub fn with_fetch_batch_size(mut self, size: usize) -> Self {
        self.fetch_batch_size = size.max(1);
        self
    }

    /// Sets the first and largest dump chunk sizes.
    pub fn with_dump_chunks(mut self, initial: u64, max: u64) -> Self {
        self.initial_dump_chunk = initial.max(1);
        self.max_dump_chunk = max.max(self.initial_dump_chunk);
        self
    }

    /// Sets the round limit.
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    /// Sets the intermediate commit count used when applying.
    pub fn with_intermediate_commit_count(mut self, count: u64) -> Self {
        self.intermediate_commit_count = count.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the interval for periodic syncs.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Dump chunk size for the batch after one of `current` documents.
    pub fn next_dump_chunk(&self, current: u64) -> u64 {
        let grown = current.saturating_add(current / 4).max(current + 1);
        grown.min(self.max_dump_chunk)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(SyncMode::Auto)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per request.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Retries immediately, without sleeping. For tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay > 0.0 {
            let jitter = delay * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay + jitter)
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// How often the malarkey transport misbehaves.
#[derive(Debug, Clone)]
pub struct MalarkeyConfig {
    /// Seed for the transport's random generator.
    pub seed: u64,
    /// Probability that a request never reaches the leader.
    pub drop_request: f64,
    /// Probability that a response is lost after the leader handled it.
    pub drop_response: f64,
    /// Probability of a timeout.
    pub timeout: f64,
}

impl MalarkeyConfig {
    /// Creates a configuration that never misbehaves.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            drop_request: 0.0,
            drop_response: 0.0,
            timeout: 0.0,
        }
    }

    /// A noisy but survivable mix, used by the convergence tests.
    pub fn noisy(seed: u64) -> Self {
        Self {
            seed,
            drop_request: 0.15,
            drop_response: 0.15,
            timeout: 0.1,
        }
    }

    /// Sets the request drop probability.
    pub fn with_drop_request(mut self, probability: f64) -> Self {
        self.drop_request = probability.clamp(0.0, 1.0);
        self
    }

    /// Sets the response drop probability.
    pub fn with_drop_response(mut self, probability: f64) -> Self {
        self.drop_response = probability.clamp(0.0, 1.0);
        self
    }

    /// Sets the timeout probability.
    pub fn with_timeout(mut self, probability: f64) -> Self {
        self.timeout = probability.clamp(0.0, 1.0);
        self
    }
}

impl Default for MalarkeyConfig {
    fn default() -> Self {
        Self::new(0x4D41_4C41)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new(SyncMode::Keys)
            .with_chunk_size(0)
            .with_bucket_count(16)
            .with_max_rounds(3)
            .with_sync_interval(Duration::from_millis(50));

        assert_eq!(config.mode, SyncMode::Keys);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.bucket_count, 16);
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.sync_interval, Duration::from_millis(50));
    }

    #[test]
    fn dump_chunks_grow_by_a_quarter_up_to_the_cap() {
        let config = SyncConfig::default().with_dump_chunks(100, 200);
        assert_eq!(config.next_dump_chunk(100), 125);
        assert_eq!(config.next_dump_chunk(125), 156);
        assert_eq!(config.next_dump_chunk(190), 200);
        assert_eq!(config.next_dump_chunk(200), 200);
        // Tiny chunks still grow.
        assert_eq!(SyncConfig::default().next_dump_chunk(1), 2);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(126));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);
        assert!(config.delay_for_attempt(5) <= Duration::from_millis(6250));
    }

    #[test]
    fn immediate_retry_never_sleeps() {
        let config = RetryConfig::immediate(4);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.delay_for_attempt(3), Duration::ZERO);
        assert_eq!(RetryConfig::no_retry().max_attempts, 1);
    }

    #[test]
    fn malarkey_probabilities_are_clamped() {
        let config = MalarkeyConfig::new(1)
            .with_drop_request(2.0)
            .with_timeout(-1.0);
        assert_eq!(config.drop_request, 1.0);
        assert_eq!(config.timeout, 0.0);
    }
}
