//! PostgreSQL job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers (in any number of processes)
//! can poll the same table without handing one job to two of them. Worker writes are
//! conditional on `state = 'active' AND claim_id = $claim`.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{JobStore, QueueDepth};
use crate::job::{Active, AnyJob, Completed, Failed, Job, JobData, JobError, Queued, Result, RetryPolicy};
use crate::types::{JobId, TaskType, WorkerId};

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Distinguish a missing job from one held by someone else after a conditional write missed.
    async fn claim_lost_or_missing(&self, id: JobId) -> JobError {
        match sqlx::query_scalar::<_, String>("SELECT state FROM generation_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(_)) => JobError::ClaimLost(id),
            Ok(None) => JobError::NotFound(id),
            Err(e) => e.into(),
        }
    }

    /// Conditional release shared by `release` and `release_stalled`. With `stale_before` set,
    /// the row must also not have heartbeated since that instant.
    async fn release_where(&self, from: &Job<Active>, next: AnyJob, stale_before: Option<DateTime<Utc>>) -> Result<()> {
        let release = ReleaseColumns::try_from(&next)?;

        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET
                state = $3,
                attempts = $4,
                available_at = COALESCE($5, available_at),
                progress = $6,
                worker_id = NULL,
                claim_id = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                result = $7,
                provider = $8,
                error = $9,
                settlement_pending = $10,
                completed_at = $11,
                failed_at = $12,
                updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND claim_id = $2
              AND ($13::timestamptz IS NULL OR heartbeat_at < $13)
            "#,
        )
        .bind(from.data.id)
        .bind(from.state.claim_id)
        .bind(release.state)
        .bind(release.attempts)
        .bind(release.available_at)
        .bind(release.progress)
        .bind(release.result)
        .bind(release.provider)
        .bind(release.error)
        .bind(release.settlement_pending)
        .bind(release.completed_at)
        .bind(release.failed_at)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.claim_lost_or_missing(from.data.id).await);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn submit(&self, job: Job<Queued>) -> Result<()> {
        let data = &job.data;
        let result = sqlx::query(
            r#"
            INSERT INTO generation_jobs (
                id, user_id, task, operation, payload, provider_hint, reservation_id, cost,
                max_attempts, base_delay_ms, backoff_multiplier, max_delay_ms,
                state, attempts, progress, available_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'queued', $13, 0, $14, $15)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(data.id)
        .bind(data.user_id)
        .bind(data.task.as_str())
        .bind(&data.operation)
        .bind(&data.payload)
        .bind(&data.provider)
        .bind(data.reservation_id)
        .bind(data.cost)
        .bind(data.retry.max_attempts as i32)
        .bind(data.retry.base_delay_ms as i64)
        .bind(data.retry.backoff_multiplier)
        .bind(data.retry.max_delay_ms as i64)
        .bind(job.state.attempts as i32)
        .bind(job.state.available_at)
        .bind(data.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::AlreadyExists(data.id));
        }
        Ok(())
    }

    async fn claim_next(&self, task: TaskType, worker_id: WorkerId) -> Result<Option<Job<Active>>> {
        let row = sqlx::query(
            r#"
            WITH next_job AS (
                SELECT id
                FROM generation_jobs
                WHERE state = 'queued'
                  AND task = $1
                  AND available_at <= NOW()
                ORDER BY available_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE generation_jobs j
            SET
                state = 'active',
                worker_id = $2,
                claim_id = $3,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                progress = 0,
                updated_at = NOW()
            FROM next_job
            WHERE j.id = next_job.id
            RETURNING j.*
            "#,
        )
        .bind(task.as_str())
        .bind(worker_id)
        .bind(Uuid::new_v4())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row_to_job(&row)?.into_active()),
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, job: &Job<Active>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET progress = $3, heartbeat_at = $4, updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND claim_id = $2
            "#,
        )
        .bind(job.data.id)
        .bind(job.state.claim_id)
        .bind(job.state.progress as i16)
        .bind(job.state.heartbeat_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.claim_lost_or_missing(job.data.id).await);
        }
        Ok(())
    }

    async fn release(&self, from: &Job<Active>, next: AnyJob) -> Result<()> {
        self.release_where(from, next, None).await
    }

    async fn release_stalled(&self, from: &Job<Active>, next: AnyJob, stale_before: DateTime<Utc>) -> Result<()> {
        self.release_where(from, next, Some(stale_before)).await
    }

    async fn get(&self, id: JobId) -> Result<AnyJob> {
        let row = sqlx::query("SELECT * FROM generation_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobError::NotFound(id))?;
        row_to_job(&row)
    }

    async fn remove_queued(&self, id: JobId) -> Result<Job<Queued>> {
        let row = sqlx::query("DELETE FROM generation_jobs WHERE id = $1 AND state = 'queued' RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return row_to_job(&row)?
                .into_queued()
                .ok_or_else(|| JobError::Other(anyhow!("Deleted job {} was not queued", id)));
        }

        let current = self.get(id).await?;
        Err(JobError::NotCancellable {
            job_id: id,
            status: current.status(),
        })
    }

    async fn find_stalled(&self, older_than: DateTime<Utc>) -> Result<Vec<Job<Active>>> {
        let rows = sqlx::query("SELECT * FROM generation_jobs WHERE state = 'active' AND heartbeat_at < $1")
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;

        let mut stalled = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(job) = row_to_job(row)?.into_active() {
                stalled.push(job);
            }
        }
        Ok(stalled)
    }

    async fn list_unsettled(&self) -> Result<Vec<AnyJob>> {
        let rows = sqlx::query(
            "SELECT * FROM generation_jobs WHERE settlement_pending AND state IN ('completed', 'failed') ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn clear_settlement_flag(&self, id: JobId) -> Result<()> {
        let result = sqlx::query("UPDATE generation_jobs SET settlement_pending = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id));
        }
        Ok(())
    }

    async fn queue_depths(&self) -> Result<HashMap<TaskType, QueueDepth>> {
        let rows = sqlx::query(
            "SELECT task, state, COUNT(*) AS count FROM generation_jobs WHERE state IN ('queued', 'active') GROUP BY task, state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut depths: HashMap<TaskType, QueueDepth> = TaskType::ALL.iter().map(|t| (*t, QueueDepth::default())).collect();
        for row in rows {
            let task: String = row.try_get("task")?;
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            let depth = depths.entry(parse_task(&task)?).or_default();
            match state.as_str() {
                "queued" => depth.queued = count as usize,
                "active" => depth.active = count as usize,
                _ => {}
            }
        }
        Ok(depths)
    }
}

/// Column values written by `release` for the target state.
struct ReleaseColumns {
    state: &'static str,
    attempts: i32,
    available_at: Option<DateTime<Utc>>,
    progress: i16,
    result: Option<serde_json::Value>,
    provider: Option<String>,
    error: Option<String>,
    settlement_pending: bool,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<&AnyJob> for ReleaseColumns {
    type Error = JobError;

    fn try_from(job: &AnyJob) -> Result<Self> {
        let empty = |state, attempts: u32| ReleaseColumns {
            state,
            attempts: attempts as i32,
            available_at: None,
            progress: 0,
            result: None,
            provider: None,
            error: None,
            settlement_pending: false,
            completed_at: None,
            failed_at: None,
        };

        Ok(match job {
            AnyJob::Queued(j) => ReleaseColumns {
                available_at: Some(j.state.available_at),
                ..empty("queued", j.state.attempts)
            },
            AnyJob::Completed(j) => ReleaseColumns {
                progress: 100,
                result: Some(j.state.result.clone()),
                provider: Some(j.state.provider.clone()),
                settlement_pending: j.state.settlement_pending,
                completed_at: Some(j.state.completed_at),
                ..empty("completed", j.state.attempts)
            },
            AnyJob::Failed(j) => ReleaseColumns {
                error: Some(j.state.error.clone()),
                settlement_pending: j.state.refund_pending,
                failed_at: Some(j.state.failed_at),
                ..empty("failed", j.state.attempts)
            },
            AnyJob::Active(j) => {
                return Err(JobError::Other(anyhow!("Job {} cannot be released into another claim", j.data.id)));
            }
        })
    }
}

fn parse_task(task: &str) -> Result<TaskType> {
    task.parse()
        .map_err(|e: String| JobError::Other(anyhow!("Corrupt job row: {}", e)))
}

fn required<T>(value: Option<T>, column: &str, id: JobId) -> Result<T> {
    value.ok_or_else(|| JobError::Other(anyhow!("Job {} is missing {}", id, column)))
}

fn row_to_job(row: &PgRow) -> Result<AnyJob> {
    let id: JobId = row.try_get("id")?;
    let task: String = row.try_get("task")?;
    let state: String = row.try_get("state")?;
    let attempts = row.try_get::<i32, _>("attempts")? as u32;

    let data = JobData {
        id,
        user_id: row.try_get("user_id")?,
        task: parse_task(&task)?,
        operation: row.try_get("operation")?,
        payload: row.try_get("payload")?,
        provider: row.try_get("provider_hint")?,
        reservation_id: row.try_get("reservation_id")?,
        cost: row.try_get("cost")?,
        retry: RetryPolicy {
            max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
            base_delay_ms: row.try_get::<i64, _>("base_delay_ms")? as u64,
            backoff_multiplier: row.try_get("backoff_multiplier")?,
            max_delay_ms: row.try_get::<i64, _>("max_delay_ms")? as u64,
        },
        created_at: row.try_get("created_at")?,
    };

    let job = match state.as_str() {
        "queued" => AnyJob::Queued(Job {
            state: Queued {
                attempts,
                available_at: row.try_get("available_at")?,
            },
            data,
        }),
        "active" => AnyJob::Active(Job {
            state: Active {
                worker_id: required(row.try_get("worker_id")?, "worker_id", id)?,
                claim_id: required(row.try_get("claim_id")?, "claim_id", id)?,
                attempts,
                claimed_at: required(row.try_get("claimed_at")?, "claimed_at", id)?,
                heartbeat_at: required(row.try_get("heartbeat_at")?, "heartbeat_at", id)?,
                progress: row.try_get::<i16, _>("progress")?.clamp(0, 100) as u8,
            },
            data,
        }),
        "completed" => AnyJob::Completed(Job {
            state: Completed {
                result: row.try_get::<Option<serde_json::Value>, _>("result")?.unwrap_or_default(),
                provider: required(row.try_get("provider")?, "provider", id)?,
                attempts,
                completed_at: required(row.try_get("completed_at")?, "completed_at", id)?,
                settlement_pending: row.try_get("settlement_pending")?,
            },
            data,
        }),
        "failed" => AnyJob::Failed(Job {
            state: Failed {
                error: row.try_get::<Option<String>, _>("error")?.unwrap_or_default(),
                attempts,
                failed_at: required(row.try_get("failed_at")?, "failed_at", id)?,
                refund_pending: row.try_get("settlement_pending")?,
            },
            data,
        }),
        other => return Err(JobError::Other(anyhow!("Job {} has unknown state '{}'", id, other))),
    };

    Ok(job)
}
