//! HTTP server implementation using Axum.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use switchyard_core::SwitchyardConfig;
use switchyard_core::config::AgentConfig;
use switchyard_core::routing::default_agent;
use switchyard_pool::{CapabilityProfile, Launcher, ProcessLauncher, WorkerPool, spawn_maintenance};
use switchyard_scheduler::{CronEngine, DispatchQueue, EngineSettings, spawn_scheduler};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::executor::PoolExecutor;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SwitchyardConfig>,
    pub start_time: std::time::Instant,
    /// Worker pool: one process per bound session.
    pub pool: Arc<WorkerPool>,
    /// Dispatcher: router + per-session queue.
    pub dispatcher: Arc<Dispatcher>,
    /// Cron engine: job table and run history.
    pub engine: CronEngine,
}

impl AppState {
    /// Wire pool → executor → queue → dispatcher → engine.
    pub fn new(config: SwitchyardConfig, launcher: Arc<dyn Launcher>) -> anyhow::Result<Self> {
        let agent_id = default_agent(&config.routing);
        let default_profile = match config.routing.agent(&agent_id) {
            Some(agent) => CapabilityProfile::for_agent(agent, &config.pool),
            None => CapabilityProfile::for_agent(&AgentConfig::named(&agent_id), &config.pool),
        };
        let pool = Arc::new(WorkerPool::new(config.pool.clone(), launcher, default_profile));
        let executor = Arc::new(PoolExecutor::new(pool.clone(), &config));
        let queue = DispatchQueue::new(config.queue.clone(), executor);
        let dispatcher = Arc::new(Dispatcher::new(&config, queue));
        let engine = CronEngine::open(
            EngineSettings::from_config(&config),
            &config.gateway.data_dir(),
            dispatcher.clone(),
        )?;

        Ok(Self {
            config: Arc::new(config),
            start_time: std::time::Instant::now(),
            pool,
            dispatcher,
            engine,
        })
    }

    pub fn queue(&self) -> &DispatchQueue {
        self.dispatcher.queue()
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        .route("/health", get(super::routes::health_check))
        // Cron jobs
        .route(
            "/jobs",
            get(super::routes::list_jobs).post(super::routes::create_job),
        )
        .route("/jobs/status", get(super::routes::jobs_status))
        .route(
            "/jobs/{id}",
            get(super::routes::get_job)
                .patch(super::routes::patch_job)
                .delete(super::routes::delete_job),
        )
        .route("/jobs/{id}/run", post(super::routes::run_job))
        .route("/jobs/{id}/runs", get(super::routes::job_runs))
        // Webhook ingress
        .route("/hooks/wake", post(super::routes::hooks_wake))
        // Introspection
        .route("/queue/stats", get(super::routes::queue_stats))
        .route("/pool/stats", get(super::routes::pool_stats))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PATCH,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the gateway: background loops plus the HTTP server.
pub async fn start(config: SwitchyardConfig) -> anyhow::Result<()> {
    let launcher = Arc::new(ProcessLauncher::new(&config.pool));
    let state = AppState::new(config, launcher)?;
    let config = state.config.clone();

    tracing::info!(
        "🧵 Worker pool: max {} (min {}), command `{}`",
        config.pool.max,
        config.pool.min,
        config.pool.command
    );
    let maintenance = spawn_maintenance(state.pool.clone());

    let scheduler = if config.scheduler.enabled {
        Some(spawn_scheduler(
            state.engine.clone(),
            Duration::from_millis(config.scheduler.tick_interval_ms.max(100)),
        ))
    } else {
        tracing::info!("⏸️ Scheduler disabled in config");
        None
    };

    let queue = state.queue().clone();
    let sweep_every = Duration::from_millis(config.pool.maintenance_interval_ms.max(100));
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let removed = queue.cleanup().await;
            if removed > 0 {
                tracing::debug!("🧹 Dropped {removed} idle session queues");
            }
        }
    });

    let pool = state.pool.clone();
    let app = build_router(state);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("🛑 Shutting down");
    sweeper.abort();
    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    pool.shutdown().await;
    maintenance.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
