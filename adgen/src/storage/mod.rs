use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{Active, AnyJob, Job, Queued, Result};
use crate::types::{JobId, TaskType, WorkerId};

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(test)]
mod tests;

pub use in_memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;

/// Number of jobs per state for one task queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub queued: usize,
    pub active: usize,
}

/// Durable record of every job and its current state.
///
/// All writes by a worker go through [`JobStore::heartbeat`] and [`JobStore::release`], which
/// only succeed while the worker's `claim_id` is still the one on record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new queued job.
    ///
    /// # Errors
    /// - `AlreadyExists` if a job with the same id is stored
    async fn submit(&self, job: Job<Queued>) -> Result<()>;

    /// Atomically claim the oldest visible queued job of `task`, ordered by
    /// `(available_at, enqueue order)`.
    async fn claim_next(&self, task: TaskType, worker_id: WorkerId) -> Result<Option<Job<Active>>>;

    /// Persist progress and heartbeat of a held job.
    ///
    /// # Errors
    /// - `ClaimLost` if `job.state.claim_id` no longer holds the job
    async fn heartbeat(&self, job: &Job<Active>) -> Result<()>;

    /// Replace the held job with `next`, conditional on the claim still being held.
    ///
    /// # Errors
    /// - `ClaimLost` if the job was taken over, or is already terminal
    async fn release(&self, from: &Job<Active>, next: AnyJob) -> Result<()>;

    /// Like [`JobStore::release`], but only while the stored heartbeat is still older than
    /// `stale_before`. Used by the sweeper, so a worker that heartbeats after the stall scan
    /// keeps its job.
    ///
    /// # Errors
    /// - `ClaimLost` if the job was taken over, is terminal, or has heartbeated since
    async fn release_stalled(&self, from: &Job<Active>, next: AnyJob, stale_before: DateTime<Utc>) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<AnyJob>;

    /// Delete a job that is still queued and hand it back.
    ///
    /// # Errors
    /// - `NotFound`
    /// - `NotCancellable` once the job has been claimed or finished
    async fn remove_queued(&self, id: JobId) -> Result<Job<Queued>>;

    /// Active jobs whose last heartbeat is older than `older_than`.
    async fn find_stalled(&self, older_than: DateTime<Utc>) -> Result<Vec<Job<Active>>>;

    /// Terminal jobs whose ledger settlement has not been confirmed.
    async fn list_unsettled(&self) -> Result<Vec<AnyJob>>;

    /// Mark the terminal job's settlement as confirmed. The only write allowed after a terminal state.
    async fn clear_settlement_flag(&self, id: JobId) -> Result<()>;

    async fn queue_depths(&self) -> Result<HashMap<TaskType, QueueDepth>>;
}
