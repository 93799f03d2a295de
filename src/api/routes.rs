//! HTTP server setup.

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::engine::ExecutionEngine;
use crate::executor::ExecutorConfig;
use crate::service::TaskService;
use crate::store::{self, TaskStore};

use super::tasks;
use super::types::HealthResponse;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub service: TaskService,
}

impl AppState {
    /// Open the store and pick the execution backend.
    pub async fn initialize(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn TaskStore> = Arc::from(
            store::create_task_store(config.store_type, config.working_dir.clone())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to open task store: {}", e))?,
        );
        tracing::info!(
            store = config.store_type.as_str(),
            persistent = store.is_persistent(),
            "Task store ready"
        );

        let executor = ExecutorConfig::resolve(&config).await?;
        let backend = executor.build();
        tracing::info!(backend = backend.name(), "Execution backend selected");

        let engine = Arc::new(ExecutionEngine::new(Arc::clone(&store), backend));
        Ok(Self {
            config,
            service: TaskService::new(store, engine),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/tasks", tasks::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::initialize(config).await?);
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then cancel running executions.
///
/// Cancelled executions are still saved before their requests complete.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling running executions");
    state.service.shutdown();
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.service.backend_name().to_string(),
        store_persistent: state.service.store_is_persistent(),
    })
}
