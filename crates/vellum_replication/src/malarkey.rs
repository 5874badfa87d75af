//! A transport that misbehaves on purpose.
//!
//! Wraps another transport and, driven by a seeded generator, drops
//! requests before the leader sees them, loses responses after the leader
//! handled them, and reports timeouts. The
//! `replicateOperations_randomize_timeout` fail point forces a timeout on
//! top of the random ones.

use crate::config::MalarkeyConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::protocol::{ReplicationRequest, ReplicationResponse};
use crate::transport::ReplicationTransport;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vellum_storage::fault::points;
use vellum_storage::{FaultController, NoFaults};

/// What the malarkey transport has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MalarkeyStats {
    /// Requests passed through and answered.
    pub delivered: u64,
    /// Requests dropped before reaching the leader.
    pub dropped_requests: u64,
    /// Responses lost after the leader answered.
    pub dropped_responses: u64,
    /// Timeouts reported.
    pub timeouts: u64,
}

/// Fault-injecting wrapper around a transport.
pub struct MalarkeyTransport<T: ReplicationTransport> {
    inner: T,
    config: MalarkeyConfig,
    rng: Mutex<StdRng>,
    faults: Arc<dyn FaultController>,
    delivered: AtomicU64,
    dropped_requests: AtomicU64,
    dropped_responses: AtomicU64,
    timeouts: AtomicU64,
}

impl<T: ReplicationTransport> MalarkeyTransport<T> {
    /// Wraps `inner`.
    pub fn new(inner: T, config: MalarkeyConfig) -> Self {
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config,
            faults: Arc::new(NoFaults),
            delivered: AtomicU64::new(0),
            dropped_requests: AtomicU64::new(0),
            dropped_responses: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Consults `faults` for the forced-timeout fail point.
    pub fn with_faults(mut self, faults: Arc<dyn FaultController>) -> Self {
        self.faults = faults;
        self
    }

    /// Returns the counters.
    pub fn stats(&self) -> MalarkeyStats {
        MalarkeyStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_requests: self.dropped_requests.load(Ordering::Relaxed),
            dropped_responses: self.dropped_responses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn roll(&self, probability: f64) -> bool {
        probability > 0.0 && self.rng.lock().gen_bool(probability.min(1.0))
    }
}

impl<T: ReplicationTransport> ReplicationTransport for MalarkeyTransport<T> {
    fn call(&self, request: &ReplicationRequest) -> ReplicationResult<ReplicationResponse> {
        if self.faults.should_fail(points::REPLICATION_RANDOM_TIMEOUT)
            || self.roll(self.config.timeout)
        {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request = request.name(), "malarkey: timeout");
            return Err(ReplicationError::Timeout);
        }
        if self.roll(self.config.drop_request) {
            self.dropped_requests.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request = request.name(), "malarkey: request dropped");
            return Err(ReplicationError::transport_retryable("request dropped"));
        }

        let response = self.inner.call(request)?;

        if self.roll(self.config.drop_response) {
            self.dropped_responses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request = request.name(), "malarkey: response dropped");
            return Err(ReplicationError::transport_retryable("response lost"));
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }
}

impl<T: ReplicationTransport> std::fmt::Debug for MalarkeyTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MalarkeyTransport")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_storage::FailPoints;

    struct Echo;

    impl ReplicationTransport for Echo {
        fn call(&self, _request: &ReplicationRequest) -> ReplicationResult<ReplicationResponse> {
            Ok(ReplicationResponse::Inventory {
                count: 0,
                max_rev: 0,
            })
        }
    }

    fn inventory() -> ReplicationRequest {
        ReplicationRequest::Inventory {
            database: "_system".into(),
            collection: "c".into(),
        }
    }

    #[test]
    fn quiet_config_passes_everything() {
        let transport = MalarkeyTransport::new(Echo, MalarkeyConfig::new(7));
        for _ in 0..50 {
            transport.call(&inventory()).unwrap();
        }
        assert_eq!(transport.stats().delivered, 50);
    }

    #[test]
    fn same_seed_same_failures() {
        let outcomes = |seed| {
            let transport = MalarkeyTransport::new(Echo, MalarkeyConfig::noisy(seed));
            (0..100)
                .map(|_| transport.call(&inventory()).is_ok())
                .collect::<Vec<_>>()
        };
        assert_eq!(outcomes(11), outcomes(11));
        assert!(outcomes(11).iter().any(|ok| !ok));
        assert!(outcomes(11).iter().any(|ok| *ok));
    }

    #[test]
    fn every_failure_is_retryable() {
        let transport = MalarkeyTransport::new(Echo, MalarkeyConfig::noisy(3));
        for _ in 0..200 {
            if let Err(err) = transport.call(&inventory()) {
                assert!(err.is_retryable(), "{err}");
            }
        }
        let stats = transport.stats();
        assert_eq!(
            stats.delivered + stats.dropped_requests + stats.dropped_responses + stats.timeouts,
            200
        );
    }

    #[test]
    fn fail_point_forces_timeouts() {
        let faults = Arc::new(FailPoints::new());
        let transport =
            MalarkeyTransport::new(Echo, MalarkeyConfig::new(1)).with_faults(faults.clone());
        faults.set_fail_at(points::REPLICATION_RANDOM_TIMEOUT);
        assert!(matches!(
            transport.call(&inventory()),
            Err(ReplicationError::Timeout)
        ));
        faults.clear_all();
        transport.call(&inventory()).unwrap();
        assert_eq!(transport.stats().timeouts, 1);
    }
}
