//! HTTP handlers for generation jobs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use crate::AppState;
use crate::api::models::GenerateRequest;
use crate::auth::Caller;
use crate::errors::{Error, Result};
use crate::job::{AnyJob, JobStatus};
use crate::queue::{EnqueuedJob, NewJob};
use crate::types::JobId;

/// Enqueue a generation job, reserving its credits.
///
/// Responds `202` with the job id immediately; generation happens in the background.
#[tracing::instrument(skip_all, fields(user_id = %caller.user_id, operation = %operation))]
pub async fn create_generation(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    caller: Caller,
    Json(body): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<EnqueuedJob>)> {
    if let Some(provider) = &body.provider {
        if !state.chain.registry().contains(provider) {
            return Err(Error::BadRequest {
                message: format!("Unknown provider '{provider}'"),
            });
        }
    }

    let enqueued = state
        .queue
        .enqueue(NewJob {
            user_id: caller.user_id,
            operation,
            payload: body.input,
            provider: body.provider,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(enqueued)))
}

/// Look up a job owned by the caller. Other users' jobs are reported as missing.
async fn owned_job(state: &AppState, caller: &Caller, job_id: JobId) -> Result<AnyJob> {
    let job = state.queue.get_job(job_id).await?;
    if job.data().user_id != caller.user_id {
        return Err(Error::NotFound {
            resource: "Job".to_string(),
            id: job_id.to_string(),
        });
    }
    Ok(job)
}

#[tracing::instrument(skip_all, fields(user_id = %caller.user_id, job_id = %job_id))]
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    caller: Caller,
) -> Result<Json<JobStatus>> {
    let job = owned_job(&state, &caller, job_id).await?;
    Ok(Json(JobStatus::from(&job)))
}

/// Cancel a job that has not started yet and refund its credits.
#[tracing::instrument(skip_all, fields(user_id = %caller.user_id, job_id = %job_id))]
pub async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<Uuid>, caller: Caller) -> Result<StatusCode> {
    owned_job(&state, &caller, job_id).await?;
    state.queue.cancel(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
