use chrono::{DateTime, Utc};

use super::types::{Active, AnyJob, Completed, Failed, Job, JobData, Queued};
use super::Result;
use crate::orchestrator::ProviderResult;
use crate::storage::JobStore;

impl Job<Queued> {
    /// A fresh job, visible immediately.
    pub fn new(data: JobData) -> Self {
        Job {
            state: Queued {
                attempts: 0,
                available_at: data.created_at,
            },
            data,
        }
    }
}

impl Job<Active> {
    /// Record progress and refresh liveness. Fails with `ClaimLost` once the claim is gone.
    pub async fn heartbeat<S: JobStore + ?Sized>(&mut self, progress: u8, store: &S) -> Result<()> {
        self.state.progress = progress.min(100);
        self.state.heartbeat_at = Utc::now();
        store.heartbeat(self).await
    }

    /// Store the winning provider's output. The ledger consume is still outstanding.
    pub async fn complete<S: JobStore + ?Sized>(self, result: ProviderResult, store: &S) -> Result<Job<Completed>> {
        let job = Job {
            state: Completed {
                result: result.output,
                provider: result.provider,
                attempts: self.state.attempts + 1,
                completed_at: Utc::now(),
                settlement_pending: true,
            },
            data: self.data.clone(),
        };
        store.release(&self, job.clone().into()).await?;
        Ok(job)
    }

    /// Finish this attempt unsuccessfully.
    ///
    /// Goes back to `Queued` after a backoff when the failure is retryable and attempts
    /// remain, otherwise to `Failed` with the refund outstanding.
    pub async fn fail<S: JobStore + ?Sized>(self, error: String, retryable: bool, store: &S) -> Result<AnyJob> {
        let next = self.next_after_failure(error, retryable);
        store.release(&self, next.clone()).await?;
        Ok(next)
    }

    /// [`Job::fail`] for a job found stalled. The write only lands while the stored heartbeat
    /// is still older than `stale_before`, so a worker that came back in between keeps the job.
    pub async fn fail_stalled<S: JobStore + ?Sized>(
        self,
        error: String,
        stale_before: DateTime<Utc>,
        store: &S,
    ) -> Result<AnyJob> {
        let next = self.next_after_failure(error, true);
        store.release_stalled(&self, next.clone(), stale_before).await?;
        Ok(next)
    }

    fn next_after_failure(&self, error: String, retryable: bool) -> AnyJob {
        let attempts = self.state.attempts + 1;
        let policy = self.data.retry;

        if retryable && policy.allows_another(attempts) {
            let delay = policy.backoff(self.state.attempts);
            let available_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            tracing::info!(
                job_id = %self.data.id,
                attempts,
                max_attempts = policy.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Requeueing job with backoff"
            );
            return Job {
                state: Queued { attempts, available_at },
                data: self.data.clone(),
            }
            .into();
        }

        tracing::warn!(
            job_id = %self.data.id,
            attempts,
            retryable,
            error = %error,
            "Job failed permanently"
        );
        Job {
            state: Failed {
                error,
                attempts,
                failed_at: Utc::now(),
                refund_pending: true,
            },
            data: self.data.clone(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RetryPolicy;
    use crate::types::TaskType;
    use serde_json::json;
    use uuid::Uuid;

    fn active(attempts: u32, max_attempts: u32) -> Job<Active> {
        let now = Utc::now();
        Job {
            state: Active {
                worker_id: Uuid::new_v4(),
                claim_id: Uuid::new_v4(),
                attempts,
                claimed_at: now,
                heartbeat_at: now,
                progress: 10,
            },
            data: JobData {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                task: TaskType::Text,
                operation: "text".to_string(),
                payload: json!({}),
                provider: None,
                reservation_id: Uuid::new_v4(),
                cost: 1,
                retry: RetryPolicy {
                    max_attempts,
                    base_delay_ms: 1_000,
                    backoff_multiplier: 2.0,
                    max_delay_ms: 10_000,
                },
                created_at: now,
            },
        }
    }

    #[test]
    fn test_retryable_failure_requeues_with_backoff() {
        let before = Utc::now();
        let next = active(1, 3).next_after_failure("timeout".into(), true);
        let AnyJob::Queued(job) = next else {
            panic!("expected requeue");
        };
        assert_eq!(job.state.attempts, 2);
        // backoff(1) = 2s
        assert!(job.state.available_at >= before + chrono::Duration::milliseconds(2_000));
    }

    #[test]
    fn test_last_attempt_fails_with_refund_pending() {
        let next = active(2, 3).next_after_failure("timeout".into(), true);
        let AnyJob::Failed(job) = next else {
            panic!("expected failure");
        };
        assert_eq!(job.state.attempts, 3);
        assert!(job.state.refund_pending);
    }

    #[test]
    fn test_permanent_failure_skips_remaining_attempts() {
        let next = active(0, 3).next_after_failure("auth".into(), false);
        assert!(matches!(next, AnyJob::Failed(ref j) if j.state.attempts == 1));
    }
}
