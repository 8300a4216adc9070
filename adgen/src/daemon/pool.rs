//! Bounded worker pool for one task queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::{Active, AnyJob, Job, JobError, Result};
use crate::orchestrator::ProviderChain;
use crate::provider::GenerationRequest;
use crate::queue::JobQueue;
use crate::storage::JobStore;
use crate::types::{TaskType, WorkerId, abbrev_uuid};

/// Progress reported once a job starts, and again while the provider chain runs.
const PROGRESS_STARTED: u8 = 10;
/// Progress reported once the provider chain has returned.
const PROGRESS_GENERATED: u8 = 90;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Jobs processed at once
    pub workers: usize,
    /// Idle wait before polling for visible jobs again
    pub claim_interval: Duration,
    /// Heartbeat period while the provider chain is running
    pub heartbeat_interval: Duration,
}

/// Claims jobs of a single task type and runs each through the provider chain.
///
/// At most `workers` jobs are in flight. The dispatch loop holds a semaphore permit before it
/// claims, so a job is never claimed without a free slot to run it.
pub struct WorkerPool {
    worker_id: WorkerId,
    task: TaskType,
    settings: PoolSettings,
    queue: JobQueue,
    chain: Arc<ProviderChain>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(
        task: TaskType,
        settings: PoolSettings,
        queue: JobQueue,
        chain: Arc<ProviderChain>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            task,
            settings,
            queue,
            chain,
            in_flight,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Dispatch until `shutdown` fires, then wait for every in-flight job to finish.
    #[tracing::instrument(skip(self, shutdown), fields(task = %self.task, worker_id = %abbrev_uuid(&self.worker_id)))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(workers = self.settings.workers, "Worker pool starting");

        let semaphore = Arc::new(Semaphore::new(self.settings.workers));
        let notify = self.queue.notifier(self.task);
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "Job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.queue.store().claim_next(self.task, self.worker_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tracing::trace!("No visible jobs, waiting");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(self.settings.claim_interval) => {}
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.claim_interval) => {}
                    }
                    continue;
                }
            };

            let job_id = job.data.id;
            tracing::debug!(job_id = %job_id, attempts = job.state.attempts, "Claimed job");

            let pool = self.clone();
            let in_flight = self.in_flight.clone();
            in_flight.fetch_add(1, Ordering::Relaxed);

            join_set.spawn(async move {
                // Permit is held for the duration of this task
                let _permit = permit;
                let _guard = scopeguard::guard((), |_| {
                    in_flight.fetch_sub(1, Ordering::Relaxed);
                });

                match pool.process(job).await {
                    Ok(()) => {}
                    Err(JobError::ClaimLost(_)) => {
                        tracing::warn!(job_id = %job_id, "Claim lost while processing, leaving job to its current owner");
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Job processing failed");
                    }
                }
            });
        }

        tracing::info!(in_flight = join_set.len(), "Worker pool stopping, waiting for in-flight jobs");
        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Job task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    /// Run one attempt of `job` and settle its credits if it ended.
    async fn process(&self, mut job: Job<Active>) -> Result<()> {
        let store = self.queue.store().as_ref();
        keep_alive(&mut job, PROGRESS_STARTED, store).await?;

        let request = GenerationRequest {
            job_id: job.data.id,
            task: job.data.task,
            operation: job.data.operation.clone(),
            input: job.data.payload.clone(),
        };
        let explicit = job.data.provider.clone();

        let run = self.chain.run(job.data.task, &request, explicit.as_deref());
        tokio::pin!(run);
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = heartbeat.tick() => keep_alive(&mut job, PROGRESS_STARTED, store).await?,
            }
        };

        keep_alive(&mut job, PROGRESS_GENERATED, store).await?;

        let finished: AnyJob = match outcome {
            Ok(result) => {
                let provider = result.provider.clone();
                let completed = job.complete(result, store).await?;
                tracing::info!(
                    job_id = %completed.data.id,
                    provider = %provider,
                    attempts = completed.state.attempts,
                    "Job completed"
                );
                completed.into()
            }
            Err(e) => job.fail(e.last_cause(), e.is_retryable(), store).await?,
        };

        if finished.is_terminal() {
            // A failed settlement stays flagged on the job for the reconciler
            let _ = self.queue.settle(&finished).await;
        }
        Ok(())
    }
}

/// Heartbeat a held job. Only a lost or deleted claim aborts the attempt. Any other failed
/// write is logged and tried again on the next tick.
async fn keep_alive<S: JobStore + ?Sized>(job: &mut Job<Active>, progress: u8, store: &S) -> Result<()> {
    match job.heartbeat(progress, store).await {
        Ok(()) => Ok(()),
        Err(e @ (JobError::ClaimLost(_) | JobError::NotFound(_))) => Err(e),
        Err(e) => {
            tracing::warn!(job_id = %job.data.id, error = %e, "Heartbeat failed, continuing");
            Ok(())
        }
    }
}
