//! Job queue service: the synchronous side of a generation request.
//!
//! [`JobQueue::enqueue`] prices the operation, reserves the credits and persists the job in
//! `queued`, then wakes the task's worker pool. It never waits on generation. Settlement of
//! finished jobs also goes through here so the worker, the sweeper and the reconciler share
//! one consume/refund path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::{Config, QueuesConfig};
use crate::job::{AnyJob, Job, JobData, JobError, JobStatus, JobStatusKind, Result, RetryPolicy};
use crate::ledger::{Ledger, Settlement};
use crate::storage::JobStore;
use crate::types::{JobId, Operation, TaskType, UserId};

/// A caller's generation request.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: UserId,
    /// Cost table key, e.g. `text-variations`
    pub operation: String,
    pub payload: serde_json::Value,
    /// Run only this provider instead of the task's chain
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedJob {
    pub job_id: JobId,
    pub status: JobStatusKind,
    pub estimated_time_seconds: u64,
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    costs: Arc<HashMap<String, i64>>,
    queues: Arc<QueuesConfig>,
    notifiers: Arc<HashMap<TaskType, Arc<Notify>>>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, ledger: Arc<dyn Ledger>, config: &Config) -> Self {
        let notifiers = TaskType::ALL.iter().map(|task| (*task, Arc::new(Notify::new()))).collect();
        Self {
            store,
            ledger,
            costs: Arc::new(config.credits.costs.clone()),
            queues: Arc::new(config.queues.clone()),
            notifiers: Arc::new(notifiers),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Woken whenever a job of `task` is enqueued.
    pub fn notifier(&self, task: TaskType) -> Arc<Notify> {
        // Every task type gets a notifier in `new`
        self.notifiers
            .get(&task)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    /// Resolve an operation key to its task and price.
    pub fn price(&self, operation: &str) -> Result<(Operation, i64)> {
        let unknown = || JobError::UnknownOperation(operation.to_string());
        let parsed: Operation = operation.parse().map_err(|_| unknown())?;
        let cost = self.costs.get(parsed.key()).copied().ok_or_else(unknown)?;
        Ok((parsed, cost))
    }

    /// Enqueue with the task queue's configured retry policy.
    pub async fn enqueue(&self, new: NewJob) -> Result<EnqueuedJob> {
        let (operation, _) = self.price(&new.operation)?;
        let policy = self.queues.get(operation.task()).retry_policy();
        self.enqueue_with_policy(new, policy).await
    }

    /// Reserve credits and persist a queued job.
    ///
    /// # Errors
    /// - `UnknownOperation` if the operation has no cost table entry
    /// - `Ledger(InsufficientCredits)` / `Ledger(AccountNotFound)` from the reservation; nothing
    ///   is persisted in that case
    #[tracing::instrument(skip(self, new, retry), fields(user_id = %new.user_id, operation = %new.operation))]
    pub async fn enqueue_with_policy(&self, new: NewJob, retry: RetryPolicy) -> Result<EnqueuedJob> {
        let (operation, cost) = self.price(&new.operation)?;
        if retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry policy must allow at least one attempt").into());
        }
        let task = operation.task();

        let job_id = Uuid::new_v4();
        let reservation_id = self.ledger.reserve(new.user_id, cost, Some(job_id)).await?;

        let job = Job::new(JobData {
            id: job_id,
            user_id: new.user_id,
            task,
            operation: operation.key().to_string(),
            payload: new.payload,
            provider: new.provider,
            reservation_id,
            cost,
            retry,
            created_at: Utc::now(),
        });

        if let Err(e) = self.store.submit(job).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist job, refunding reservation");
            if let Err(refund_err) = self.ledger.refund(reservation_id).await {
                tracing::error!(
                    job_id = %job_id,
                    reservation_id = %reservation_id,
                    error = %refund_err,
                    "Failed to refund reservation of unpersisted job"
                );
            }
            return Err(e);
        }

        self.notifier(task).notify_one();
        tracing::info!(job_id = %job_id, task = %task, cost, "Job enqueued");

        Ok(EnqueuedJob {
            job_id,
            status: JobStatusKind::Queued,
            estimated_time_seconds: self.queues.get(task).estimated_time.as_secs(),
        })
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<AnyJob> {
        self.store.get(job_id).await
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatus> {
        Ok(JobStatus::from(&self.store.get(job_id).await?))
    }

    /// Withdraw a job that no worker has claimed yet, and refund its reservation.
    ///
    /// # Errors
    /// - `NotCancellable` once the job is active or finished
    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: JobId) -> Result<Settlement> {
        let job = self.store.remove_queued(job_id).await?;
        let settlement = self.ledger.refund(job.data.reservation_id).await.map_err(|e| {
            tracing::error!(
                reservation_id = %job.data.reservation_id,
                error = %e,
                "Cancelled job was removed but its refund failed"
            );
            e
        })?;
        tracing::info!(task = %job.data.task, "Job cancelled and refunded");
        Ok(settlement)
    }

    /// Run the ledger call owed by a terminal job and clear its flag once the ledger confirms.
    ///
    /// Returns `None` when nothing is owed. A ledger failure leaves the flag set so
    /// [`JobQueue::reconcile_settlements`] can retry it.
    pub async fn settle(&self, job: &AnyJob) -> Result<Option<Settlement>> {
        let settlement = match job {
            AnyJob::Completed(j) if j.state.settlement_pending => self.ledger.consume(j.data.reservation_id).await,
            AnyJob::Failed(j) if j.state.refund_pending => self.ledger.refund(j.data.reservation_id).await,
            _ => return Ok(None),
        };

        let settlement = match settlement {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(
                    job_id = %job.id(),
                    status = %job.status(),
                    reservation_id = %job.data().reservation_id,
                    error = %e,
                    "Credit settlement failed, left for reconciliation"
                );
                return Err(e.into());
            }
        };

        self.store.clear_settlement_flag(job.id()).await?;
        tracing::debug!(
            job_id = %job.id(),
            status = %job.status(),
            applied = settlement.was_applied(),
            "Credit settlement recorded"
        );
        Ok(Some(settlement))
    }

    /// Retry every outstanding settlement. Returns how many were confirmed.
    pub async fn reconcile_settlements(&self) -> Result<usize> {
        let unsettled = self.store.list_unsettled().await?;
        if unsettled.is_empty() {
            return Ok(0);
        }

        let mut settled = 0;
        for job in &unsettled {
            if self.settle(job).await.is_ok() {
                settled += 1;
            }
        }

        tracing::info!(outstanding = unsettled.len(), settled, "Settlement reconciliation finished");
        Ok(settled)
    }

    /// Refund reservations whose job was never stored or has since been removed.
    ///
    /// Covers an enqueue whose persist and inline refund both failed, and a cancel whose
    /// refund failed after the job was deleted. Only reservations older than `grace` are
    /// considered, so an enqueue still between reserve and persist is left alone. Returns how
    /// many were refunded.
    pub async fn reconcile_orphaned_reservations(&self, grace: Duration) -> Result<usize> {
        let grace = chrono::Duration::from_std(grace).map_err(|e| anyhow::anyhow!("orphan grace out of range: {e}"))?;
        let pending = self.ledger.list_pending_reservations(Utc::now() - grace).await?;

        let mut refunded = 0;
        for reservation in pending {
            // Reservations taken outside the queue have no job to look for
            let Some(job_id) = reservation.job_id else {
                continue;
            };
            match self.store.get(job_id).await {
                Ok(_) => continue,
                Err(JobError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not look up job of pending reservation");
                    continue;
                }
            }

            match self.ledger.refund(reservation.id).await {
                Ok(settlement) => {
                    tracing::warn!(
                        job_id = %job_id,
                        reservation_id = %reservation.id,
                        user_id = %reservation.user_id,
                        amount = reservation.amount,
                        applied = settlement.was_applied(),
                        "Refunded reservation without a stored job"
                    );
                    if settlement.was_applied() {
                        refunded += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        reservation_id = %reservation.id,
                        error = %e,
                        "Failed to refund reservation without a stored job"
                    );
                }
            }
        }
        Ok(refunded)
    }
}
