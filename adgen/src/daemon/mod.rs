//! Background processing: one worker pool per task type plus the maintenance loops.
//!
//! [`Daemon::run`] owns every background task of the service:
//!
//! - a [`WorkerPool`] per [`TaskType`], each with its own concurrency limit
//! - the stalled-job [`Sweeper`]
//! - the settlement reconciler, retrying consume/refund calls that did not go through
//! - the periodic ledger audit
//! - an optional status logger
//!
//! All of them stop when the shutdown token is cancelled. Pools stop claiming and wait for
//! their in-flight jobs, so `run` returns only once no job is mid-attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DaemonConfig, QueuesConfig, SweeperConfig};
use crate::ledger::audit::run_audit;
use crate::orchestrator::ProviderChain;
use crate::queue::JobQueue;
use crate::types::TaskType;

pub mod pool;
pub mod sweeper;

pub use pool::{PoolSettings, WorkerPool};
pub use sweeper::Sweeper;

/// Lower bound for the in-job heartbeat period.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

pub struct Daemon {
    queue: JobQueue,
    chain: Arc<ProviderChain>,
    queues: QueuesConfig,
    settings: DaemonConfig,
    sweeper: SweeperConfig,
    audit_interval: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl Daemon {
    pub fn new(queue: JobQueue, chain: Arc<ProviderChain>, config: &Config) -> Self {
        Self {
            queue,
            chain,
            queues: config.queues.clone(),
            settings: config.daemon.clone(),
            sweeper: config.sweeper.clone(),
            audit_interval: config.ledger.audit_interval,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Jobs currently being processed across all pools.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn pool_settings(&self, task: TaskType) -> PoolSettings {
        PoolSettings {
            workers: self.queues.get(task).workers,
            claim_interval: self.settings.claim_interval,
            // Several heartbeats fit in one liveness window
            heartbeat_interval: (self.sweeper.liveness_threshold / 3).max(MIN_HEARTBEAT_INTERVAL),
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!("Daemon starting");
        let mut tasks: JoinSet<()> = JoinSet::new();

        for task in TaskType::ALL {
            let pool = Arc::new(WorkerPool::new(
                task,
                self.pool_settings(task),
                self.queue.clone(),
                self.chain.clone(),
                self.in_flight.clone(),
            ));
            tasks.spawn(pool.run(shutdown.clone()));
        }

        let sweeper = Sweeper::new(
            self.queue.clone(),
            self.sweeper.interval,
            self.sweeper.liveness_threshold,
        );
        tasks.spawn(sweeper.run(shutdown.clone()));

        tasks.spawn(run_audit(self.queue.ledger().clone(), self.audit_interval, shutdown.clone()));
        tasks.spawn(run_reconciler(
            self.queue.clone(),
            self.settings.reconcile_interval,
            self.settings.orphan_grace,
            shutdown.clone(),
        ));

        if let Some(interval) = self.settings.status_log_interval {
            tasks.spawn(run_status_log(
                self.queue.clone(),
                self.in_flight.clone(),
                interval,
                shutdown.clone(),
            ));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Daemon task panicked");
            }
        }
        tracing::info!("Daemon stopped");
    }
}

/// Retry outstanding settlements and refund orphaned reservations every `interval`, starting
/// immediately so that work left over from a previous process is picked up at startup.
async fn run_reconciler(queue: JobQueue, interval: Duration, orphan_grace: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = queue.reconcile_settlements().await {
                    tracing::error!(error = %e, "Settlement reconciliation failed");
                }
                match queue.reconcile_orphaned_reservations(orphan_grace).await {
                    Ok(0) => {}
                    Ok(refunded) => tracing::info!(refunded, "Refunded orphaned reservations"),
                    Err(e) => tracing::error!(error = %e, "Orphaned reservation reconciliation failed"),
                }
            }
        }
    }
}

async fn run_status_log(queue: JobQueue, in_flight: Arc<AtomicUsize>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let depths = match queue.store().queue_depths().await {
                    Ok(depths) => depths,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read queue depths");
                        continue;
                    }
                };
                for task in TaskType::ALL {
                    let depth = depths.get(&task).copied().unwrap_or_default();
                    tracing::debug!(task = %task, queued = depth.queued, active = depth.active, "Queue status");
                }
                tracing::debug!(jobs_in_flight = in_flight.load(Ordering::Relaxed), "Daemon status");
            }
        }
    }
}
