use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use batchd_core::PruneConfig;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::snapshot::LoadOutcome;

use super::Scheduler;

impl Scheduler {
    /// Prune with the scheduler's own configuration.
    pub fn prune(&self) -> Result<Vec<String>> {
        self.prune_with(&self.config)
    }

    /// Forget silent workers, reclaim hard timeouts and requeue FAILED tasks
    /// whose retry delay has passed. Returns the pruned worker ids.
    pub fn prune_with<C: PruneConfig + ?Sized>(&self, config: &C) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let reclaimed = inner.state.reclaim_timed_out(&mut inner.pool, now);
        let pruned = inner.state.prune(config, &mut inner.pool, now);
        let retried = inner.state.retry_failed(self.config.retry_delay, now);
        inner.counters.record_prune(pruned.len(), reclaimed.len(), now);

        debug!(
            pruned = pruned.len(),
            reclaimed = reclaimed.len(),
            retried = retried.len(),
            "prune pass complete"
        );
        Ok(pruned)
    }

    /// Persist the task graph to `path`.
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        self.lock()?.state.dump(path)
    }

    /// Replace the task graph with the snapshot at `path`.
    ///
    /// Missing and corrupt files reset to an empty state and are reported in
    /// the outcome. Resource usage is rebuilt from the restored RUNNING tasks.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadOutcome> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let outcome = inner.state.load(path);
        inner.pool.rebuild(inner.state.running_resources());
        Ok(outcome)
    }

    /// Run [`Scheduler::prune`] every `interval` until `shutdown` is notified.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: Arc<Notify>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; start sweeping one interval in.
            ticker.tick().await;
            info!(interval = ?interval, "sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.prune() {
                            error!(error = %e, "prune failed, stopping sweeper");
                            break;
                        }
                    }
                    _ = shutdown.notified() => {
                        break;
                    }
                }
            }
            info!("sweeper stopped");
        })
    }
}
