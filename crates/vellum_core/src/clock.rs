//! Hybrid logical clock for document revisions.
//!
//! A revision is the larger of "microseconds since the epoch" and "last
//! issued revision plus one". Revisions are therefore strictly increasing
//! within a process, track wall time when the clock is idle, and never go
//! backwards across a restart as long as recovery feeds every stored
//! revision through [`HybridLogicalClock::observe`].

use crate::types::Revision;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Issues strictly increasing revisions.
#[derive(Debug, Default)]
pub struct HybridLogicalClock {
    last: AtomicU64,
}

fn physical_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl HybridLogicalClock {
    /// Creates a clock that has issued nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next revision.
    pub fn next(&self) -> Revision {
        let now = physical_now();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(last + 1);
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Revision::new(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    /// Records a revision seen elsewhere so later revisions exceed it.
    pub fn observe(&self, rev: Revision) {
        self.last.fetch_max(rev.as_u64(), Ordering::AcqRel);
    }

    /// Returns the last issued or observed revision.
    #[must_use]
    pub fn last(&self) -> Revision {
        Revision::new(self.last.load(Ordering::Acquire))
    }
}
