use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::queue_manager::{EnqueueOutcome, QueueManager};
use crate::store::{StaleScope, TaskStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryStats {
    pub orphaned_recovered: usize,
    pub own_recovered: usize,
}

impl RecoveryStats {
    pub fn total(&self) -> usize {
        self.orphaned_recovered + self.own_recovered
    }
}

/// Periodic sweep over the durable store for orphaned or stalled records.
///
/// Two independent sweeps, each switchable via `RecoveryConfig`:
/// - orphan sweep: records owned by another (presumably crashed) node,
///   untouched past the staleness threshold;
/// - self-recovery sweep: records this node owns but lost track of.
///
/// Re-admission goes through the normal queue dedup, so sweeping a task
/// that is already queued is a no-op. Recovered `IN_FLIGHT` records get
/// their stale open attempt aborted when the runner picks them up.
pub struct RecoverySweeper {
    store: Arc<dyn TaskStore>,
    queue: Arc<QueueManager>,
    config: RecoveryConfig,
    node: Uuid,
}

impl RecoverySweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<QueueManager>,
        config: RecoveryConfig,
        node: Uuid,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            node,
        }
    }

    /// One pass of both enabled sweeps. Also used as the one-shot start-up
    /// recovery before the periodic loop's first tick.
    pub async fn run_once(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();

        if self.config.recover_orphaned {
            stats.orphaned_recovered = self.sweep(StaleScope::Orphaned).await?;
        }

        if self.config.recover_own {
            stats.own_recovered = self.sweep(StaleScope::Owned).await?;
        }

        if stats.total() > 0 {
            info!(
                "Recovery sweep re-admitted {} task(s) ({} orphaned, {} own)",
                stats.total(),
                stats.orphaned_recovered,
                stats.own_recovered
            );
        }

        Ok(stats)
    }

    async fn sweep(&self, scope: StaleScope) -> Result<usize> {
        let cutoff = Utc::now() - self.config.stale_after();
        let records = self.store.find_stale(self.node, cutoff, scope).await?;

        let mut readmitted = 0;
        for record in records {
            match self.queue.add_scheduled(record.to_task()) {
                EnqueueOutcome::Added => {
                    info!(
                        "Re-admitted stale task {} ({scope:?} sweep, last touched {})",
                        record.id, record.updated_at
                    );
                    readmitted += 1;
                }
                EnqueueOutcome::Duplicate => {
                    // Already queued here; the sweep is idempotent.
                }
                EnqueueOutcome::Full => {
                    warn!(
                        "Queue full during recovery sweep, task {} left for the next pass",
                        record.id
                    );
                    break;
                }
                EnqueueOutcome::Unpersisted => {
                    error!("Stale record {} produced a task without an id", record.id);
                }
            }
        }

        Ok(readmitted)
    }

    /// Start the periodic sweep loop: a start-up pass immediately, then one
    /// pass per interval until shutdown is signalled.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_once().await {
                error!("Start-up recovery sweep failed: {e:#}");
            }

            let period = self.config.sweep_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        if let Err(e) = self.run_once().await {
                            error!("Recovery sweep failed: {e:#}");
                        }
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Recovery sweeper stopped");
        })
    }
}
