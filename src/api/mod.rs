mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use errors::{AppError, ErrorResponse};

use crate::engine::{OperationRegistry, Scheduler, WorkerTracker};
use crate::ledger::RunLedger;
use crate::lifecycle::{self, Lifecycle, LifecycleDeps, LifecycleSettings};
use crate::probe::docker::DockerRuntime;
use crate::probe::{ClusterRuntime, InMemoryRuntime};
use crate::storage;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub scheduler: Scheduler,
    pub ledger: Arc<RunLedger>,
    pub lifecycle: Arc<Lifecycle>,
    pub runtime: Arc<dyn ClusterRuntime>,
}

/// Everything `serve` needs to wire the application.
#[derive(Debug, Clone)]
pub struct ServeSettings {
    pub host: String,
    pub port: u16,
    pub max_body: usize,
    /// Schedule store location, see [`storage::open_store`].
    pub store: String,
    /// SQLite database url (`sqlite::memory:`) or file path for the run ledger.
    pub ledger: String,
    /// `memory` or the Docker Engine API base url.
    pub runtime: String,
    pub worker_slots: Option<usize>,
    pub lifecycle: LifecycleSettings,
}

/// Open store, ledger and runtime, register the lifecycle operations and recover
/// schedules left over by a previous process.
pub async fn build_state(settings: &ServeSettings) -> Result<Arc<AppState>> {
    let kv = storage::open_store(&settings.store).await?;

    let ledger = if settings.ledger.starts_with("sqlite:") {
        RunLedger::connect(&settings.ledger).await
    } else {
        RunLedger::from_path(&settings.ledger).await
    }
    .with_context(|| format!("Failed to open run ledger: {}", settings.ledger))?;
    let ledger = Arc::new(ledger);

    let runtime: Arc<dyn ClusterRuntime> = if settings.runtime == "memory" {
        Arc::new(InMemoryRuntime::new())
    } else {
        Arc::new(DockerRuntime::new(&settings.runtime, Duration::from_secs(30))?)
    };

    let deps = LifecycleDeps {
        ledger: ledger.clone(),
        runtime: runtime.clone(),
        kv: kv.clone(),
        settings: settings.lifecycle.clone(),
    };
    let mut registry = OperationRegistry::new();
    lifecycle::register_operations(&mut registry, &deps)?;

    let tracker = match settings.worker_slots {
        Some(slots) => WorkerTracker::new(slots),
        None => WorkerTracker::from_env(),
    };
    let scheduler = Scheduler::new(Arc::new(registry), kv.clone(), Arc::new(tracker));

    let parked = scheduler.recover().await?;
    if parked > 0 {
        info!(parked = parked, "Interrupted schedules are waiting for manual intervention");
    }

    let lifecycle = Arc::new(Lifecycle::new(scheduler.clone(), ledger.clone(), kv));

    Ok(Arc::new(AppState {
        scheduler,
        ledger,
        lifecycle,
        runtime,
    }))
}

/// All routes, without body limit or HTTP layers.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/services/start", post(handlers::start_service))
        .route("/services/stop", post(handlers::stop_service))
        .route("/services/{node_id}/presence", get(handlers::get_presence))
        .route("/runs", get(handlers::list_runs))
        .route(
            "/runs/{id}",
            get(handlers::get_run).delete(handlers::delete_run),
        )
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .route("/runs/{id}/manual-intervention", post(handlers::flag_run))
        .route("/schedules/{id}", get(handlers::get_schedule))
        .route("/schedules/{id}/cancel", post(handlers::cancel_schedule))
        .route(
            "/schedules/{id}/steps/{step}/restart",
            post(handlers::restart_step),
        )
        .route("/operations", get(handlers::list_operations))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(settings: ServeSettings) -> Result<()> {
    let state = build_state(&settings).await?;

    let app = router(state)
        .layer(DefaultBodyLimit::max(settings.max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    info!("dynsched API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
