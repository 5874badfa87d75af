//! Periodic replication on a tokio runtime.

use crate::engine::ReplicationEngine;
use crate::error::{ReplicationError, ReplicationResult};
use crate::state::SyncReport;
use crate::transport::ReplicationTransport;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vellum_core::Database;

/// Result of the latest sync run by a [`ReplicationTask`].
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// The follower matched the leader at the end of the sync.
    Converged(SyncReport),
    /// The sync ran out of rounds; the next one continues.
    Pending(SyncReport),
    /// The sync failed.
    Failed(String),
}

impl SyncOutcome {
    /// Returns true for [`SyncOutcome::Converged`].
    pub fn is_converged(&self) -> bool {
        matches!(self, SyncOutcome::Converged(_))
    }
}

/// Keeps one collection in sync in the background.
///
/// Each sync runs on the blocking pool since the engine does blocking I/O.
/// Conflicts stop the task; other failures are retried after the interval.
pub struct ReplicationTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    outcomes: watch::Receiver<Option<SyncOutcome>>,
}

impl ReplicationTask {
    /// Starts syncing `collection` of `follower` every
    /// `engine.config().sync_interval`.
    pub fn spawn<T>(
        engine: Arc<ReplicationEngine<T>>,
        follower: Database,
        collection: impl Into<String>,
    ) -> Self
    where
        T: ReplicationTransport + 'static,
    {
        let collection = collection.into();
        let (shutdown, mut stop) = watch::channel(false);
        let (publish, outcomes) = watch::channel(None);
        let interval = engine.config().sync_interval;

        let handle = tokio::spawn(async move {
            loop {
                let run_engine = engine.clone();
                let db = follower.clone();
                let name = collection.clone();
                let joined =
                    tokio::task::spawn_blocking(move || run_engine.sync(&db, &name)).await;

                let outcome = match joined {
                    Ok(Ok(report)) if report.converged => SyncOutcome::Converged(report),
                    Ok(Ok(report)) => SyncOutcome::Pending(report),
                    Ok(Err(err)) => {
                        let fatal = matches!(err, ReplicationError::Conflict { .. });
                        publish.send_replace(Some(SyncOutcome::Failed(err.to_string())));
                        if fatal {
                            tracing::error!(collection = %collection, error = %err, "replication stopped");
                            break;
                        }
                        tracing::warn!(collection = %collection, error = %err, "sync failed, will retry");
                        if wait(&mut stop, interval).await {
                            break;
                        }
                        continue;
                    }
                    Err(join) => {
                        tracing::error!(error = %join, "sync worker panicked");
                        publish.send_replace(Some(SyncOutcome::Failed(join.to_string())));
                        break;
                    }
                };
                publish.send_replace(Some(outcome));
                if wait(&mut stop, interval).await {
                    break;
                }
            }
            tracing::debug!(collection = %collection, "replication task stopped");
        });

        Self {
            handle,
            shutdown,
            outcomes,
        }
    }

    /// The latest outcome, if any sync finished yet.
    pub fn latest(&self) -> Option<SyncOutcome> {
        self.outcomes.borrow().clone()
    }

    /// Waits for the next sync to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Cancelled`] if the task has stopped.
    pub async fn next_outcome(&mut self) -> ReplicationResult<SyncOutcome> {
        loop {
            self.outcomes
                .changed()
                .await
                .map_err(|_| ReplicationError::Cancelled)?;
            if let Some(outcome) = self.outcomes.borrow_and_update().clone() {
                return Ok(outcome);
            }
        }
    }

    /// Stops the task after the running sync, if any, finishes.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Cancelled`] if the task panicked.
    pub async fn shutdown(self) -> ReplicationResult<()> {
        // The task may already have stopped on its own.
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|_| ReplicationError::Cancelled)
    }
}

/// Sleeps for `interval`; returns true if shutdown was requested.
async fn wait(stop: &mut watch::Receiver<bool>, interval: std::time::Duration) -> bool {
    if *stop.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}
