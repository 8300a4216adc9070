use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rstest::{fixture, rstest};
use serde_json::json;
use uuid::Uuid;

use crate::job::{AnyJob, Job, JobError, JobStatusKind};
use crate::orchestrator::ProviderResult;
use crate::storage::{InMemoryJobStore, JobStore};
use crate::test_utils::sample_job_data;
use crate::types::TaskType;

#[cfg(feature = "postgres")]
use crate::storage::PostgresJobStore;

/// Fixture that returns an InMemoryJobStore
#[fixture]
fn in_memory_store() -> Arc<dyn JobStore> {
    Arc::new(InMemoryJobStore::new())
}

fn winning(provider: &str) -> ProviderResult {
    ProviderResult {
        provider: provider.to_string(),
        output: json!({"text": "Run further."}),
        failures: vec![],
    }
}

async fn run_test_submit_and_get(store: Arc<dyn JobStore>) {
    let job = Job::new(sample_job_data(TaskType::Text));
    let id = job.data.id;
    store.submit(job.clone()).await.unwrap();

    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.status(), JobStatusKind::Queued);
    assert_eq!(stored.data().operation, job.data.operation);
    assert_eq!(stored.data().payload, job.data.payload);
    assert_eq!(stored.data().retry, job.data.retry);

    assert!(matches!(store.submit(job).await, Err(JobError::AlreadyExists(dup)) if dup == id));
    assert!(matches!(store.get(Uuid::new_v4()).await, Err(JobError::NotFound(_))));
}

#[rstest]
#[tokio::test]
async fn test_submit_and_get(in_memory_store: Arc<dyn JobStore>) {
    run_test_submit_and_get(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_submit_and_get_postgres(pool: sqlx::PgPool) {
    run_test_submit_and_get(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_claim_is_exclusive_and_per_task(store: Arc<dyn JobStore>) {
    let job = Job::new(sample_job_data(TaskType::Image));
    store.submit(job.clone()).await.unwrap();

    // Other task queues do not see it
    assert!(store.claim_next(TaskType::Text, Uuid::new_v4()).await.unwrap().is_none());

    let worker = Uuid::new_v4();
    let claimed = store.claim_next(TaskType::Image, worker).await.unwrap().unwrap();
    assert_eq!(claimed.data.id, job.data.id);
    assert_eq!(claimed.state.worker_id, worker);
    assert_eq!(claimed.state.attempts, 0);

    assert!(store.claim_next(TaskType::Image, Uuid::new_v4()).await.unwrap().is_none());
    assert_eq!(store.get(job.data.id).await.unwrap().status(), JobStatusKind::Active);
}

#[rstest]
#[tokio::test]
async fn test_claim_is_exclusive_and_per_task(in_memory_store: Arc<dyn JobStore>) {
    run_test_claim_is_exclusive_and_per_task(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_claim_is_exclusive_and_per_task_postgres(pool: sqlx::PgPool) {
    run_test_claim_is_exclusive_and_per_task(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_concurrent_claims_never_share_a_job(store: Arc<dyn JobStore>) {
    for _ in 0..20 {
        store.submit(Job::new(sample_job_data(TaskType::Speech))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker = Uuid::new_v4();
            let mut mine = Vec::new();
            while let Some(job) = store.claim_next(TaskType::Speech, worker).await.unwrap() {
                mine.push(job.data.id);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_job(in_memory_store: Arc<dyn JobStore>) {
    run_test_concurrent_claims_never_share_a_job(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_concurrent_claims_never_share_a_job_postgres(pool: sqlx::PgPool) {
    run_test_concurrent_claims_never_share_a_job(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_claim_order_and_visibility(store: Arc<dyn JobStore>) {
    let now = Utc::now();

    let mut newer = Job::new(sample_job_data(TaskType::Text));
    newer.state.available_at = now - Duration::seconds(10);
    let mut older = Job::new(sample_job_data(TaskType::Text));
    older.state.available_at = now - Duration::seconds(60);
    let mut delayed = Job::new(sample_job_data(TaskType::Text));
    delayed.state.available_at = now + Duration::hours(1);

    store.submit(newer.clone()).await.unwrap();
    store.submit(delayed.clone()).await.unwrap();
    store.submit(older.clone()).await.unwrap();

    let worker = Uuid::new_v4();
    let first = store.claim_next(TaskType::Text, worker).await.unwrap().unwrap();
    let second = store.claim_next(TaskType::Text, worker).await.unwrap().unwrap();
    assert_eq!(first.data.id, older.data.id);
    assert_eq!(second.data.id, newer.data.id);

    // Backoff not over yet
    assert!(store.claim_next(TaskType::Text, worker).await.unwrap().is_none());
}

#[rstest]
#[tokio::test]
async fn test_claim_order_and_visibility(in_memory_store: Arc<dyn JobStore>) {
    run_test_claim_order_and_visibility(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_claim_order_and_visibility_postgres(pool: sqlx::PgPool) {
    run_test_claim_order_and_visibility(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_heartbeat_persists_progress(store: Arc<dyn JobStore>) {
    store.submit(Job::new(sample_job_data(TaskType::Video))).await.unwrap();
    let mut active = store.claim_next(TaskType::Video, Uuid::new_v4()).await.unwrap().unwrap();

    active.heartbeat(42, store.as_ref()).await.unwrap();

    let stored = store.get(active.data.id).await.unwrap();
    assert_eq!(stored.progress(), 42);
}

#[rstest]
#[tokio::test]
async fn test_heartbeat_persists_progress(in_memory_store: Arc<dyn JobStore>) {
    run_test_heartbeat_persists_progress(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_heartbeat_persists_progress_postgres(pool: sqlx::PgPool) {
    run_test_heartbeat_persists_progress(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_stale_claim_cannot_write(store: Arc<dyn JobStore>) {
    store.submit(Job::new(sample_job_data(TaskType::Image))).await.unwrap();
    let mut stale = store.claim_next(TaskType::Image, Uuid::new_v4()).await.unwrap().unwrap();
    let id = stale.data.id;

    // The sweeper takes the job back (zero backoff in sample jobs) and a second worker claims it
    let requeued = stale.clone().fail("worker stopped heartbeating".into(), true, store.as_ref()).await.unwrap();
    assert_eq!(requeued.status(), JobStatusKind::Queued);
    let current = store.claim_next(TaskType::Image, Uuid::new_v4()).await.unwrap().unwrap();
    assert_eq!(current.state.attempts, 1);

    // The original worker returns late
    assert!(matches!(stale.heartbeat(90, store.as_ref()).await, Err(JobError::ClaimLost(_))));
    assert!(matches!(
        stale.clone().complete(winning("late"), store.as_ref()).await,
        Err(JobError::ClaimLost(_))
    ));

    // The current holder finishes normally, after which nobody can overwrite it
    current.clone().complete(winning("current"), store.as_ref()).await.unwrap();
    assert!(matches!(
        current.fail("again".into(), false, store.as_ref()).await,
        Err(JobError::ClaimLost(_))
    ));

    match store.get(id).await.unwrap() {
        AnyJob::Completed(job) => {
            assert_eq!(job.state.provider, "current");
            assert_eq!(job.state.attempts, 2);
        }
        other => panic!("expected completed job, got {:?}", other.status()),
    }
}

#[rstest]
#[tokio::test]
async fn test_stale_claim_cannot_write(in_memory_store: Arc<dyn JobStore>) {
    run_test_stale_claim_cannot_write(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_stale_claim_cannot_write_postgres(pool: sqlx::PgPool) {
    run_test_stale_claim_cannot_write(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_remove_only_while_queued(store: Arc<dyn JobStore>) {
    let queued = Job::new(sample_job_data(TaskType::Text));
    store.submit(queued.clone()).await.unwrap();
    let removed = store.remove_queued(queued.data.id).await.unwrap();
    assert_eq!(removed.data.id, queued.data.id);
    assert!(matches!(store.get(queued.data.id).await, Err(JobError::NotFound(_))));

    store.submit(Job::new(sample_job_data(TaskType::Text))).await.unwrap();
    let active = store.claim_next(TaskType::Text, Uuid::new_v4()).await.unwrap().unwrap();
    assert!(matches!(
        store.remove_queued(active.data.id).await,
        Err(JobError::NotCancellable {
            status: JobStatusKind::Active,
            ..
        })
    ));
    assert!(matches!(store.remove_queued(Uuid::new_v4()).await, Err(JobError::NotFound(_))));
}

#[rstest]
#[tokio::test]
async fn test_remove_only_while_queued(in_memory_store: Arc<dyn JobStore>) {
    run_test_remove_only_while_queued(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_remove_only_while_queued_postgres(pool: sqlx::PgPool) {
    run_test_remove_only_while_queued(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_find_stalled_uses_heartbeat(store: Arc<dyn JobStore>) {
    store.submit(Job::new(sample_job_data(TaskType::Speech))).await.unwrap();
    let active = store.claim_next(TaskType::Speech, Uuid::new_v4()).await.unwrap().unwrap();

    let fresh = store.find_stalled(Utc::now() - Duration::minutes(5)).await.unwrap();
    assert!(fresh.is_empty());

    let stalled = store.find_stalled(Utc::now() + Duration::seconds(1)).await.unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].data.id, active.data.id);
    assert_eq!(stalled[0].state.claim_id, active.state.claim_id);
}

#[rstest]
#[tokio::test]
async fn test_find_stalled_uses_heartbeat(in_memory_store: Arc<dyn JobStore>) {
    run_test_find_stalled_uses_heartbeat(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_find_stalled_uses_heartbeat_postgres(pool: sqlx::PgPool) {
    run_test_find_stalled_uses_heartbeat(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_stall_release_yields_to_fresh_heartbeat(store: Arc<dyn JobStore>) {
    store.submit(Job::new(sample_job_data(TaskType::Video))).await.unwrap();
    store.submit(Job::new(sample_job_data(TaskType::Video))).await.unwrap();
    let mut slow = store.claim_next(TaskType::Video, Uuid::new_v4()).await.unwrap().unwrap();
    let gone = store.claim_next(TaskType::Video, Uuid::new_v4()).await.unwrap().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let cutoff = Utc::now();
    let stalled = store.find_stalled(cutoff).await.unwrap();
    assert_eq!(stalled.len(), 2);
    let seen_slow = stalled.iter().find(|job| job.data.id == slow.data.id).cloned().unwrap();
    let seen_gone = stalled.iter().find(|job| job.data.id == gone.data.id).cloned().unwrap();

    // The slow worker heartbeats between the scan and the release
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    slow.heartbeat(40, store.as_ref()).await.unwrap();

    let err = seen_slow
        .fail_stalled("worker stopped heartbeating".into(), cutoff, store.as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::ClaimLost(id) if id == slow.data.id));
    let AnyJob::Active(still_held) = store.get(slow.data.id).await.unwrap() else {
        panic!("expected the job to stay with its worker");
    };
    assert_eq!(still_held.state.claim_id, slow.state.claim_id);
    assert_eq!(still_held.state.progress, 40);
    slow.complete(winning("videogen"), store.as_ref()).await.unwrap();

    // The silent one is released as usual
    let next = seen_gone
        .fail_stalled("worker stopped heartbeating".into(), cutoff, store.as_ref())
        .await
        .unwrap();
    assert_eq!(next.status(), JobStatusKind::Queued);
    assert_eq!(store.get(gone.data.id).await.unwrap().status(), JobStatusKind::Queued);
}

#[rstest]
#[tokio::test]
async fn test_stall_release_yields_to_fresh_heartbeat(in_memory_store: Arc<dyn JobStore>) {
    run_test_stall_release_yields_to_fresh_heartbeat(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_stall_release_yields_to_fresh_heartbeat_postgres(pool: sqlx::PgPool) {
    run_test_stall_release_yields_to_fresh_heartbeat(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_unsettled_jobs_and_flag_clearing(store: Arc<dyn JobStore>) {
    store.submit(Job::new(sample_job_data(TaskType::Text))).await.unwrap();
    store.submit(Job::new(sample_job_data(TaskType::Text))).await.unwrap();
    let worker = Uuid::new_v4();

    let first = store.claim_next(TaskType::Text, worker).await.unwrap().unwrap();
    let completed = first.complete(winning("openai"), store.as_ref()).await.unwrap();
    let second = store.claim_next(TaskType::Text, worker).await.unwrap().unwrap();
    let failed = second.fail("invalid input".into(), false, store.as_ref()).await.unwrap();

    let unsettled: HashSet<_> = store.list_unsettled().await.unwrap().iter().map(AnyJob::id).collect();
    assert_eq!(unsettled, HashSet::from([completed.data.id, failed.id()]));

    store.clear_settlement_flag(completed.data.id).await.unwrap();
    let unsettled: Vec<_> = store.list_unsettled().await.unwrap().iter().map(AnyJob::id).collect();
    assert_eq!(unsettled, vec![failed.id()]);

    // Clearing the flag leaves the terminal state itself untouched
    match store.get(completed.data.id).await.unwrap() {
        AnyJob::Completed(job) => {
            assert!(!job.state.settlement_pending);
            assert_eq!(job.state.provider, "openai");
        }
        other => panic!("expected completed job, got {:?}", other.status()),
    }
}

#[rstest]
#[tokio::test]
async fn test_unsettled_jobs_and_flag_clearing(in_memory_store: Arc<dyn JobStore>) {
    run_test_unsettled_jobs_and_flag_clearing(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_unsettled_jobs_and_flag_clearing_postgres(pool: sqlx::PgPool) {
    run_test_unsettled_jobs_and_flag_clearing(Arc::new(PostgresJobStore::new(pool))).await;
}

async fn run_test_queue_depths(store: Arc<dyn JobStore>) {
    for _ in 0..3 {
        store.submit(Job::new(sample_job_data(TaskType::Image))).await.unwrap();
    }
    store.submit(Job::new(sample_job_data(TaskType::Video))).await.unwrap();
    store.claim_next(TaskType::Image, Uuid::new_v4()).await.unwrap().unwrap();

    let depths = store.queue_depths().await.unwrap();
    assert_eq!(depths[&TaskType::Image].queued, 2);
    assert_eq!(depths[&TaskType::Image].active, 1);
    assert_eq!(depths[&TaskType::Video].queued, 1);
    assert_eq!(depths[&TaskType::Text].queued, 0);
}

#[rstest]
#[tokio::test]
async fn test_queue_depths(in_memory_store: Arc<dyn JobStore>) {
    run_test_queue_depths(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_queue_depths_postgres(pool: sqlx::PgPool) {
    run_test_queue_depths(Arc::new(PostgresJobStore::new(pool))).await;
}
