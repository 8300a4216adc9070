//! In-memory job store.
//!
//! All jobs live in one map behind a mutex, so claim and release are trivially atomic.
//! Suitable for tests and single-process deployments. Jobs are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{JobStore, QueueDepth};
use crate::job::{Active, AnyJob, Job, JobError, Queued, Result};
use crate::types::{JobId, TaskType, WorkerId};

struct StoredJob {
    job: AnyJob,
    /// Enqueue order, breaks ties between equal `available_at`
    seq: u64,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs, any state.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The stored job must still be active under the caller's claim.
fn check_claim(stored: Option<&StoredJob>, from: &Job<Active>) -> Result<()> {
    match stored.map(|s| &s.job) {
        Some(AnyJob::Active(current)) if current.state.claim_id == from.state.claim_id => Ok(()),
        Some(_) => Err(JobError::ClaimLost(from.data.id)),
        None => Err(JobError::NotFound(from.data.id)),
    }
}

/// Swap in `next` for a job whose claim has already been checked.
fn replace_held(state: &mut State, from: &Job<Active>, next: AnyJob) {
    let seq = state.next_seq + 1;
    if let Some(stored) = state.jobs.get_mut(&from.data.id) {
        // A requeued job joins the back of the line for its new available_at
        if matches!(next, AnyJob::Queued(_)) {
            stored.seq = seq;
        }
        stored.job = next;
    }
    state.next_seq = seq;
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit(&self, job: Job<Queued>) -> Result<()> {
        let mut state = self.state.lock();
        let id = job.data.id;
        if state.jobs.contains_key(&id) {
            return Err(JobError::AlreadyExists(id));
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state.jobs.insert(id, StoredJob { job: job.into(), seq });
        Ok(())
    }

    async fn claim_next(&self, task: TaskType, worker_id: WorkerId) -> Result<Option<Job<Active>>> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let next_id = state
            .jobs
            .values()
            .filter_map(|stored| match &stored.job {
                AnyJob::Queued(job) if job.data.task == task && job.state.available_at <= now => {
                    Some((job.state.available_at, stored.seq, job.data.id))
                }
                _ => None,
            })
            .min()
            .map(|(_, _, id)| id);

        let Some(id) = next_id else {
            return Ok(None);
        };
        let Some(stored) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let AnyJob::Queued(queued) = &stored.job else {
            return Ok(None);
        };

        let active = Job {
            state: Active {
                worker_id,
                claim_id: Uuid::new_v4(),
                attempts: queued.state.attempts,
                claimed_at: now,
                heartbeat_at: now,
                progress: 0,
            },
            data: queued.data.clone(),
        };
        stored.job = active.clone().into();
        Ok(Some(active))
    }

    async fn heartbeat(&self, job: &Job<Active>) -> Result<()> {
        let mut state = self.state.lock();
        check_claim(state.jobs.get(&job.data.id), job)?;
        if let Some(stored) = state.jobs.get_mut(&job.data.id) {
            stored.job = job.clone().into();
        }
        Ok(())
    }

    async fn release(&self, from: &Job<Active>, next: AnyJob) -> Result<()> {
        let mut state = self.state.lock();
        check_claim(state.jobs.get(&from.data.id), from)?;
        replace_held(&mut state, from, next);
        Ok(())
    }

    async fn release_stalled(&self, from: &Job<Active>, next: AnyJob, stale_before: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state.jobs.get(&from.data.id);
        check_claim(stored, from)?;
        if let Some(AnyJob::Active(current)) = stored.map(|s| &s.job)
            && current.state.heartbeat_at >= stale_before
        {
            return Err(JobError::ClaimLost(from.data.id));
        }
        replace_held(&mut state, from, next);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<AnyJob> {
        self.state
            .lock()
            .jobs
            .get(&id)
            .map(|stored| stored.job.clone())
            .ok_or(JobError::NotFound(id))
    }

    async fn remove_queued(&self, id: JobId) -> Result<Job<Queued>> {
        let mut state = self.state.lock();
        match state.jobs.get(&id).map(|s| &s.job) {
            None => return Err(JobError::NotFound(id)),
            Some(AnyJob::Queued(_)) => {}
            Some(other) => {
                return Err(JobError::NotCancellable {
                    job_id: id,
                    status: other.status(),
                });
            }
        }

        match state.jobs.remove(&id).map(|s| s.job) {
            Some(AnyJob::Queued(job)) => Ok(job),
            _ => Err(JobError::NotFound(id)),
        }
    }

    async fn find_stalled(&self, older_than: DateTime<Utc>) -> Result<Vec<Job<Active>>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter_map(|stored| match &stored.job {
                AnyJob::Active(job) if job.state.heartbeat_at < older_than => Some(job.clone()),
                _ => None,
            })
            .collect())
    }

    async fn list_unsettled(&self) -> Result<Vec<AnyJob>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|stored| stored.job.settlement_pending())
            .map(|stored| stored.job.clone())
            .collect())
    }

    async fn clear_settlement_flag(&self, id: JobId) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state.jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        match &mut stored.job {
            AnyJob::Completed(job) => job.state.settlement_pending = false,
            AnyJob::Failed(job) => job.state.refund_pending = false,
            _ => {}
        }
        Ok(())
    }

    async fn queue_depths(&self) -> Result<HashMap<TaskType, QueueDepth>> {
        let state = self.state.lock();
        let mut depths: HashMap<TaskType, QueueDepth> = TaskType::ALL.iter().map(|t| (*t, QueueDepth::default())).collect();
        for stored in state.jobs.values() {
            let depth = depths.entry(stored.job.data().task).or_default();
            match stored.job {
                AnyJob::Queued(_) => depth.queued += 1,
                AnyJob::Active(_) => depth.active += 1,
                _ => {}
            }
        }
        Ok(depths)
    }
}
