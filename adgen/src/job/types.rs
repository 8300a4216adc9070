//! Generation job lifecycle using the typestate pattern.
//!
//! A job is `Queued`, `Active` (claimed by exactly one worker), or terminal (`Completed` /
//! `Failed`). Transitions only exist on the state they start from, so a worker can only
//! finish a job it holds as `Job<Active>`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ClaimId, JobId, ReservationId, TaskType, UserId, WorkerId};

/// Marker trait for valid job states.
pub trait JobState: Send + Sync {}

#[derive(Debug, Clone, PartialEq)]
pub struct Job<S: JobState> {
    pub state: S,
    pub data: JobData,
}

/// Immutable job description, fixed at enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct JobData {
    pub id: JobId,
    pub user_id: UserId,
    pub task: TaskType,
    /// Cost table key, e.g. `text-variations`
    pub operation: String,
    /// Opaque to the queue; handed to the provider as-is
    pub payload: serde_json::Value,
    /// Explicit provider requested by the caller, bypassing the chain
    pub provider: Option<String>,
    /// Settlement handle from `Ledger::reserve`
    pub reservation_id: ReservationId,
    pub cost: i64,
    pub retry: RetryPolicy,
    pub created_at: DateTime<Utc>,
}

/// Retry parameters captured per job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `finished_attempts` failures:
    /// `min(base * multiplier^n, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = exponential.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether a job that has now finished `attempts` attempts may run again.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

// ============================================================================
// Job States
// ============================================================================

/// Waiting for a worker. Not claimable before `available_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Queued {
    /// Finished attempts so far
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
}

impl JobState for Queued {}

/// Held by one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Active {
    pub worker_id: WorkerId,
    /// Identifies this particular claim; every write by the holder is conditional on it
    pub claim_id: ClaimId,
    pub attempts: u32,
    pub claimed_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// 0-100
    pub progress: u8,
}

impl JobState for Active {}

#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub result: serde_json::Value,
    pub provider: String,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
    /// Set until `Ledger::consume` is confirmed
    pub settlement_pending: bool,
}

impl JobState for Completed {}

#[derive(Debug, Clone, PartialEq)]
pub struct Failed {
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// Set until `Ledger::refund` is confirmed
    pub refund_pending: bool,
}

impl JobState for Failed {}

// ============================================================================
// Unified Job Representation
// ============================================================================

/// Coarse status, as reported to callers and stored in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatusKind {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatusKind::Queued => "queued",
            JobStatusKind::Active => "active",
            JobStatusKind::Completed => "completed",
            JobStatusKind::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job in any state, for storage and status queries.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyJob {
    Queued(Job<Queued>),
    Active(Job<Active>),
    Completed(Job<Completed>),
    Failed(Job<Failed>),
}

impl AnyJob {
    pub fn id(&self) -> JobId {
        self.data().id
    }

    pub fn data(&self) -> &JobData {
        match self {
            AnyJob::Queued(j) => &j.data,
            AnyJob::Active(j) => &j.data,
            AnyJob::Completed(j) => &j.data,
            AnyJob::Failed(j) => &j.data,
        }
    }

    pub fn status(&self) -> JobStatusKind {
        match self {
            AnyJob::Queued(_) => JobStatusKind::Queued,
            AnyJob::Active(_) => JobStatusKind::Active,
            AnyJob::Completed(_) => JobStatusKind::Completed,
            AnyJob::Failed(_) => JobStatusKind::Failed,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            AnyJob::Queued(j) => j.state.attempts,
            AnyJob::Active(j) => j.state.attempts,
            AnyJob::Completed(j) => j.state.attempts,
            AnyJob::Failed(j) => j.state.attempts,
        }
    }

    pub fn progress(&self) -> u8 {
        match self {
            AnyJob::Queued(_) | AnyJob::Failed(_) => 0,
            AnyJob::Active(j) => j.state.progress,
            AnyJob::Completed(_) => 100,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyJob::Completed(_) | AnyJob::Failed(_))
    }

    /// Terminal job whose ledger settlement has not been confirmed yet.
    pub fn settlement_pending(&self) -> bool {
        match self {
            AnyJob::Completed(j) => j.state.settlement_pending,
            AnyJob::Failed(j) => j.state.refund_pending,
            _ => false,
        }
    }

    pub fn into_queued(self) -> Option<Job<Queued>> {
        match self {
            AnyJob::Queued(j) => Some(j),
            _ => None,
        }
    }

    pub fn into_active(self) -> Option<Job<Active>> {
        match self {
            AnyJob::Active(j) => Some(j),
            _ => None,
        }
    }
}

impl From<Job<Queued>> for AnyJob {
    fn from(j: Job<Queued>) -> Self {
        AnyJob::Queued(j)
    }
}

impl From<Job<Active>> for AnyJob {
    fn from(j: Job<Active>) -> Self {
        AnyJob::Active(j)
    }
}

impl From<Job<Completed>> for AnyJob {
    fn from(j: Job<Completed>) -> Self {
        AnyJob::Completed(j)
    }
}

impl From<Job<Failed>> for AnyJob {
    fn from(j: Job<Failed>) -> Self {
        AnyJob::Failed(j)
    }
}

/// Read-only view returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub status: JobStatusKind,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_pending: Option<bool>,
}

impl From<&AnyJob> for JobStatus {
    fn from(job: &AnyJob) -> Self {
        let mut status = JobStatus {
            job_id: job.id(),
            status: job.status(),
            progress: job.progress(),
            result: None,
            error: None,
            provider: None,
            attempts: job.attempts(),
            refund_pending: None,
        };

        match job {
            AnyJob::Completed(j) => {
                status.result = Some(j.state.result.clone());
                status.provider = Some(j.state.provider.clone());
            }
            AnyJob::Failed(j) => {
                let settlement = if j.state.refund_pending {
                    "credit refund pending"
                } else {
                    "credits refunded"
                };
                status.error = Some(format!("{} ({settlement})", j.state.error));
                status.refund_pending = Some(j.state.refund_pending);
            }
            AnyJob::Queued(_) | AnyJob::Active(_) => {}
        }

        status
    }
}
