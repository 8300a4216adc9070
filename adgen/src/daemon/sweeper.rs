//! Recovery of jobs whose worker stopped heartbeating.
//!
//! A stalled job counts as a failed, retryable attempt. The release is conditional on the claim
//! and on the heartbeat still being older than the cutoff, so a worker that heartbeats or
//! finishes after the scan wins and the sweeper's write is dropped.

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::job::JobError;
use crate::queue::JobQueue;

pub const STALLED_ERROR: &str = "worker stopped heartbeating";

pub struct Sweeper {
    queue: JobQueue,
    interval: Duration,
    liveness_threshold: Duration,
}

impl Sweeper {
    pub fn new(queue: JobQueue, interval: Duration, liveness_threshold: Duration) -> Self {
        Self {
            queue,
            interval,
            liveness_threshold,
        }
    }

    /// Requeue or fail every stalled job once. Returns how many were recovered.
    pub async fn sweep_once(&self) -> anyhow::Result<usize> {
        let threshold = chrono::Duration::from_std(self.liveness_threshold).context("liveness threshold out of range")?;
        let store = self.queue.store().as_ref();
        let cutoff = Utc::now() - threshold;
        let stalled = store.find_stalled(cutoff).await?;

        let mut recovered = 0;
        for job in stalled {
            let job_id = job.data.id;
            tracing::warn!(
                job_id = %job_id,
                worker_id = %job.state.worker_id,
                heartbeat_at = %job.state.heartbeat_at,
                "Recovering stalled job"
            );

            match job.fail_stalled(STALLED_ERROR.to_string(), cutoff, store).await {
                Ok(next) => {
                    recovered += 1;
                    if next.is_terminal() {
                        let _ = self.queue.settle(&next).await;
                    }
                }
                Err(JobError::ClaimLost(_)) => {
                    tracing::debug!(job_id = %job_id, "Stalled job was heartbeated or released by its worker in the meantime");
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to recover stalled job");
                }
            }
        }

        Ok(recovered)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(recovered) => tracing::info!(recovered, "Recovered stalled jobs"),
                        Err(e) => tracing::error!(error = %e, "Stalled job sweep failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AnyJob, JobStatusKind};
    use crate::ledger::Ledger;
    use crate::queue::NewJob;
    use crate::storage::JobStore;
    use crate::test_utils::{create_test_config, funded_user, in_memory_queue};
    use crate::types::TaskType;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_stalled_job_is_requeued_with_one_more_attempt() {
        let (queue, store, ledger) = in_memory_queue(&create_test_config());
        let user = funded_user(ledger.as_ref(), 5).await;
        let enqueued = queue
            .enqueue(NewJob {
                user_id: user,
                operation: "image".into(),
                payload: json!({}),
                provider: None,
            })
            .await
            .unwrap();

        // A worker claims the job and then disappears
        store.claim_next(TaskType::Image, Uuid::new_v4()).await.unwrap().unwrap();

        let lenient = Sweeper::new(queue.clone(), Duration::from_secs(1), Duration::from_secs(600));
        assert_eq!(lenient.sweep_once().await.unwrap(), 0);

        let sweeper = Sweeper::new(queue.clone(), Duration::from_secs(1), Duration::ZERO);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

        let AnyJob::Queued(job) = store.get(enqueued.job_id).await.unwrap() else {
            panic!("expected requeued job");
        };
        assert_eq!(job.state.attempts, 1);
        // Still reserved, not settled
        assert_eq!(ledger.get_balance(user).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_stalled_job_out_of_attempts_fails_and_refunds() {
        let (queue, store, ledger) = in_memory_queue(&create_test_config());
        let user = funded_user(ledger.as_ref(), 5).await;
        let enqueued = queue
            .enqueue_with_policy(
                NewJob {
                    user_id: user,
                    operation: "video".into(),
                    payload: json!({}),
                    provider: None,
                },
                crate::test_utils::instant_retry(1),
            )
            .await
            .unwrap();
        assert_eq!(ledger.get_balance(user).await.unwrap(), 2);

        store.claim_next(TaskType::Video, Uuid::new_v4()).await.unwrap().unwrap();
        let sweeper = Sweeper::new(queue.clone(), Duration::from_secs(1), Duration::ZERO);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

        let status = queue.get_status(enqueued.job_id).await.unwrap();
        assert_eq!(status.status, JobStatusKind::Failed);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.error.as_deref(), Some("worker stopped heartbeating (credits refunded)"));
        assert_eq!(ledger.get_balance(user).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_late_worker_cannot_finish_swept_job() {
        let (queue, store, ledger) = in_memory_queue(&create_test_config());
        let user = funded_user(ledger.as_ref(), 5).await;
        queue
            .enqueue(NewJob {
                user_id: user,
                operation: "text".into(),
                payload: json!({}),
                provider: None,
            })
            .await
            .unwrap();

        let late = store.claim_next(TaskType::Text, Uuid::new_v4()).await.unwrap().unwrap();
        Sweeper::new(queue.clone(), Duration::from_secs(1), Duration::ZERO)
            .sweep_once()
            .await
            .unwrap();

        let result = crate::orchestrator::ProviderResult {
            provider: "late".into(),
            output: json!({"text": "late copy"}),
            failures: vec![],
        };
        assert!(matches!(late.complete(result, store.as_ref()).await, Err(JobError::ClaimLost(_))));
        assert_eq!(ledger.get_balance(user).await.unwrap(), 4);
    }
}
