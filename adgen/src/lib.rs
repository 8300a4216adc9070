//! # adgen: generation jobs and credits for AI ad creatives
//!
//! `adgen` accepts requests to generate ad copy, images, video and voice-overs, runs them
//! asynchronously against a chain of AI vendors, and charges each user from a prepaid credit
//! balance.
//!
//! ## Request Flow
//!
//! `POST /generate/{operation}` prices the operation, reserves the credits in the [`ledger`]
//! and persists a queued job in the [`storage`] layer, answering `202 Accepted` with the job id.
//! Nothing else happens on the request path.
//!
//! The [`daemon`] runs one worker pool per task queue. A pool claims a queued job, hands it to
//! the [`orchestrator`], which tries the configured [`provider`]s in order, and then moves the
//! job to `completed` (consuming the reservation) or back to `queued` with a backoff delay. A job
//! that runs out of attempts or fails permanently ends up `failed` and its credits are refunded.
//!
//! Clients poll `GET /generate/status/{job_id}` until the job reaches a terminal state.
//!
//! ## Background Services
//!
//! Alongside the worker pools the daemon runs a sweeper that requeues jobs whose worker stopped
//! heartbeating, a reconciler that retries settlements the ledger refused earlier, and a periodic
//! ledger audit that replays every account's transaction log.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use adgen::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = adgen::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     adgen::telemetry::init_telemetry(config.log_format)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await
//! }
//! ```
pub mod api;
pub mod auth;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod job;
pub mod ledger;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod storage;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};

pub use config::Config;

use crate::config::DatabaseConfig;
use crate::daemon::Daemon;
use crate::ledger::{InMemoryLedger, Ledger};
use crate::orchestrator::ProviderChain;
use crate::provider::ProviderRegistry;
use crate::queue::JobQueue;
use crate::storage::{InMemoryJobStore, JobStore};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: JobQueue,
    pub ledger: Arc<dyn Ledger>,
    pub chain: Arc<ProviderChain>,
}

impl AppState {
    pub fn new(config: Config, queue: JobQueue, chain: Arc<ProviderChain>) -> Self {
        Self {
            config: Arc::new(config),
            ledger: queue.ledger().clone(),
            queue,
            chain,
        }
    }
}

/// Get the adgen database migrator
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Build the HTTP router with all routes and the tracing layer.
pub fn build_router(state: AppState) -> Router {
    use api::handlers::{credits, generate, health};

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/generate/status/{job_id}", get(generate::get_job_status))
        // `{key}` is an operation name on POST and a job id on DELETE
        .route(
            "/generate/{key}",
            post(generate::create_generation).delete(generate::cancel_job),
        )
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Job store and ledger for the configured backend.
struct Storage {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    #[cfg(feature = "postgres")]
    pool: Option<sqlx::PgPool>,
}

async fn setup_storage(config: &Config) -> anyhow::Result<Storage> {
    match &config.database {
        DatabaseConfig::Memory => {
            info!("Using in-memory job store and ledger; state is lost on restart");
            Ok(Storage {
                store: Arc::new(InMemoryJobStore::new()),
                ledger: Arc::new(InMemoryLedger::new()),
                #[cfg(feature = "postgres")]
                pool: None,
            })
        }
        #[cfg(feature = "postgres")]
        DatabaseConfig::Postgres { url, max_connections } => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(*max_connections)
                .connect(url)
                .await?;
            migrator().run(&pool).await?;
            info!("Connected to PostgreSQL and applied migrations");
            Ok(Storage {
                store: Arc::new(storage::PostgresJobStore::new(pool.clone())),
                ledger: Arc::new(ledger::PostgresLedger::new(pool.clone())),
                pool: Some(pool),
            })
        }
        #[cfg(not(feature = "postgres"))]
        DatabaseConfig::Postgres { .. } => {
            anyhow::bail!("database type 'postgres' requires the `postgres` feature")
        }
    }
}

/// The job daemon running alongside the HTTP server.
///
/// Dropping this cancels the shutdown token through `drop_guard`, which stops the daemon
/// without waiting for in-flight jobs. Call [`BackgroundServices::shutdown`] to drain them.
pub struct BackgroundServices {
    daemon: Arc<Daemon>,
    handle: tokio::task::JoinHandle<()>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    fn start(daemon: Daemon) -> Self {
        let shutdown_token = CancellationToken::new();
        let drop_guard = shutdown_token.clone().drop_guard();
        let daemon = Arc::new(daemon);
        let handle = tokio::spawn(daemon.clone().run(shutdown_token.clone()));
        Self {
            daemon,
            handle,
            shutdown_token,
            drop_guard: Some(drop_guard),
        }
    }

    /// Stop claiming new jobs and wait for the ones in flight to finish
    pub async fn shutdown(self) {
        info!(in_flight = self.daemon.in_flight(), "Stopping job daemon");
        self.shutdown_token.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Job daemon task failed");
        }
    }
}

/// Owns the router, the storage backend and the background daemon.
pub struct Application {
    router: Router,
    state: AppState,
    config: Config,
    bg_services: BackgroundServices,
    #[cfg(feature = "postgres")]
    pool: Option<sqlx::PgPool>,
}

impl Application {
    /// Create the application with providers built from `config.providers`.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let registry = ProviderRegistry::from_config(&config.providers)?;
        Self::with_registry(config, registry).await
    }

    /// Create the application around an existing provider registry.
    pub async fn with_registry(config: Config, registry: ProviderRegistry) -> anyhow::Result<Self> {
        debug!("Starting adgen with configuration: {:#?}", config);

        let storage = setup_storage(&config).await?;
        let queue = JobQueue::new(storage.store, storage.ledger, &config);
        let chain = Arc::new(ProviderChain::new(registry, config.chains.to_map()));

        let bg_services = BackgroundServices::start(Daemon::new(queue.clone(), chain.clone(), &config));
        let state = AppState::new(config.clone(), queue, chain);
        let router = build_router(state.clone());

        Ok(Self {
            router,
            state,
            config,
            bg_services,
            #[cfg(feature = "postgres")]
            pool: storage.pool,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "adgen listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // In-flight jobs are settled before storage goes away
        self.bg_services.shutdown().await;

        #[cfg(feature = "postgres")]
        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        Ok(())
    }
}
