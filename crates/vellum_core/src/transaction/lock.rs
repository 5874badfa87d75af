//! Collection locks.
//!
//! `Read` and `Write` share the lock; `Exclusive` excludes everybody else.
//! Guards are owned so a transaction can hold several of them.

use crate::types::AccessMode;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
}

/// A shared/exclusive lock with timeouts.
#[derive(Default)]
pub struct CollectionLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl CollectionLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for the lock in `mode`. Returns `None` on
    /// timeout.
    pub fn acquire(
        self: &Arc<Self>,
        mode: AccessMode,
        timeout: Duration,
    ) -> Option<CollectionLockGuard> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let free = if mode.is_exclusive() {
                !state.exclusive && state.shared == 0
            } else {
                !state.exclusive
            };
            if free {
                if mode.is_exclusive() {
                    state.exclusive = true;
                } else {
                    state.shared += 1;
                }
                return Some(CollectionLockGuard {
                    lock: Arc::clone(self),
                    exclusive: mode.is_exclusive(),
                });
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    fn release(&self, exclusive: bool) {
        let mut state = self.state.lock();
        if exclusive {
            state.exclusive = false;
        } else {
            state.shared = state.shared.saturating_sub(1);
        }
        drop(state);
        self.released.notify_all();
    }
}

impl fmt::Debug for CollectionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CollectionLock")
            .field("shared", &state.shared)
            .field("exclusive", &state.exclusive)
            .finish()
    }
}

/// Releases its lock on drop.
pub struct CollectionLockGuard {
    lock: Arc<CollectionLock>,
    exclusive: bool,
}

impl Drop for CollectionLockGuard {
    fn drop(&mut self) {
        self.lock.release(self.exclusive);
    }
}

impl fmt::Debug for CollectionLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionLockGuard")
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn readers_and_writers_share() {
        let lock = Arc::new(CollectionLock::new());
        let _r = lock.acquire(AccessMode::Read, SHORT).unwrap();
        let _w = lock.acquire(AccessMode::Write, SHORT).unwrap();
        assert!(lock.acquire(AccessMode::Exclusive, SHORT).is_none());
    }

    #[test]
    fn exclusive_blocks_everyone() {
        let lock = Arc::new(CollectionLock::new());
        let guard = lock.acquire(AccessMode::Exclusive, SHORT).unwrap();
        assert!(lock.acquire(AccessMode::Read, SHORT).is_none());
        drop(guard);
        assert!(lock.acquire(AccessMode::Read, SHORT).is_some());
    }

    #[test]
    fn waiter_wakes_on_release() {
        let lock = Arc::new(CollectionLock::new());
        let guard = lock.acquire(AccessMode::Exclusive, SHORT).unwrap();
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.acquire(AccessMode::Exclusive, Duration::from_secs(5))
                    .is_some()
            })
        };
        thread::sleep(Duration::from_millis(10));
        drop(guard);
        assert!(waiter.join().unwrap());
    }
}
