//! Shared helpers for unit and integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::config::{Config, QueueConfig};
use crate::{AppState, build_router};
use crate::job::{JobData, JobStatus, JobStatusKind, RetryPolicy};
use crate::ledger::{InMemoryLedger, Ledger};
use crate::orchestrator::ProviderChain;
use crate::provider::{MockProvider, ProviderRegistry};
use crate::queue::JobQueue;
use crate::storage::{InMemoryJobStore, JobStore};
use crate::types::{JobId, TaskType, Tier, UserId};

/// Retry policy without any backoff, so a requeued job is claimable immediately.
pub fn instant_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 0,
        backoff_multiplier: 2.0,
        max_delay_ms: 0,
    }
}

pub fn sample_job_data(task: TaskType) -> JobData {
    JobData {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        task,
        operation: task.as_str().to_string(),
        payload: json!({"prompt": "Summer sale, 20% off running shoes"}),
        provider: None,
        reservation_id: Uuid::new_v4(),
        cost: 1,
        retry: instant_retry(3),
        created_at: Utc::now(),
    }
}

/// Config tuned for tests: short intervals, no backoff, small pools.
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    for task in TaskType::ALL {
        *config.queues.get_mut(task) = QueueConfig {
            workers: 2,
            max_attempts: 3,
            base_delay: Duration::ZERO,
            backoff_multiplier: 2.0,
            max_delay: Duration::ZERO,
            estimated_time: Duration::from_secs(5),
        };
    }
    config.daemon.claim_interval = Duration::from_millis(10);
    config.daemon.status_log_interval = None;
    config.sweeper.interval = Duration::from_millis(20);
    config.ledger.audit_interval = Duration::from_secs(60);
    config.providers.clear();
    config.chains.clear();
    config
}

/// Register mock providers under their own names and build chains from `(task, [names])`.
pub fn mock_chain(providers: &[MockProvider], chains: &[(TaskType, &[&str])]) -> ProviderChain {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(Arc::new(provider.clone()));
    }
    let chains: HashMap<TaskType, Vec<String>> = chains
        .iter()
        .map(|(task, names)| (*task, names.iter().map(|n| n.to_string()).collect()))
        .collect();
    ProviderChain::new(registry, chains)
}

/// In-memory store, ledger and a queue over them, built from `config`.
pub fn in_memory_queue(config: &Config) -> (JobQueue, Arc<InMemoryJobStore>, Arc<InMemoryLedger>) {
    let store = Arc::new(InMemoryJobStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let queue = JobQueue::new(
        store.clone() as Arc<dyn JobStore>,
        ledger.clone() as Arc<dyn Ledger>,
        config,
    );
    (queue, store, ledger)
}

/// Open a standard account holding `credits`.
pub async fn funded_user<L: Ledger + ?Sized>(ledger: &L, credits: i64) -> UserId {
    let user = Uuid::new_v4();
    ledger
        .open_account(user, Tier::Standard, credits)
        .await
        .expect("Failed to open test account");
    user
}

/// Poll until the job reaches a terminal state and any refund has been applied, failing the
/// test after five seconds.
pub async fn wait_for_terminal(queue: &JobQueue, job_id: JobId) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = queue.get_status(job_id).await.expect("job should exist");
            let terminal = matches!(status.status, JobStatusKind::Completed | JobStatusKind::Failed);
            if terminal && status.refund_pending != Some(true) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

/// A test server over in-memory state with no daemon running, so jobs stay where the test
/// puts them.
pub fn create_test_app(config: Config, chain: ProviderChain) -> (axum_test::TestServer, AppState) {
    let (queue, _store, _ledger) = in_memory_queue(&config);
    let state = AppState::new(config, queue, Arc::new(chain));
    let server = axum_test::TestServer::new(build_router(state.clone())).expect("Failed to create test server");
    (server, state)
}
