//! QueryGraph Orchestrator Server
//!
//! Runs the resumable query workflow behind a REST API and a WebSocket
//! event channel, with pause, interrupt, resume and cancel controls.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use querygraph_orchestrator::{
    broadcast::EventBroadcaster,
    config::{AppConfig, DatabaseConfig, InterruptStoreKind},
    db::{create_pool, init_schema, DbPool},
    engine::{QueryOptions, WorkflowEngine, WorkflowGraph},
    handlers,
    hitl::{HitlManager, InterruptStore, MemoryInterruptStore, PgInterruptStore},
    registry::ExecutionRegistry,
    services::{Collaborators, HttpBackend},
    state::AppState,
};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,querygraph_orchestrator=debug,tower_http=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Build the application router with all routes.
fn build_router(state: AppState) -> Router {
    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::api_health))
        .with_state(state.clone());

    let query_routes = Router::new()
        .route("/api/query", post(handlers::submit_query))
        .route("/ws", get(handlers::ws_handler))
        .with_state(state.clone());

    let executions_routes = Router::new()
        .route("/api/interrupts", get(handlers::executions::list_interrupts))
        .route(
            "/api/executions/{execution_id}",
            get(handlers::executions::get),
        )
        .route(
            "/api/executions/{execution_id}/history",
            get(handlers::executions::history),
        )
        .route(
            "/api/executions/{execution_id}/adjustments",
            get(handlers::executions::adjustments),
        )
        .route(
            "/api/executions/{execution_id}/pause",
            post(handlers::executions::pause),
        )
        .route(
            "/api/executions/{execution_id}/interrupt",
            post(handlers::executions::interrupt),
        )
        .route(
            "/api/executions/{execution_id}/resume",
            post(handlers::executions::resume),
        )
        .route(
            "/api/executions/{execution_id}/cancel",
            post(handlers::executions::cancel),
        )
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .merge(query_routes)
        .merge(executions_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Open the configured interrupt store.
async fn open_interrupt_store(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn InterruptStore>, Option<DbPool>)> {
    match config.interrupt_store {
        InterruptStoreKind::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let pool = create_pool(&db_config).await?;
            init_schema(&pool).await?;
            tracing::info!(host = %db_config.host, database = %db_config.database, "Interrupt store ready");
            Ok((Arc::new(PgInterruptStore::new(pool.clone())), Some(pool)))
        }
        InterruptStoreKind::Memory => {
            tracing::warn!("Using in-memory interrupt store, interrupts will not survive a restart");
            Ok((Arc::new(MemoryInterruptStore::new()), None))
        }
    }
}

/// Periodically expire stale pauses, purge old cancelled interrupts and
/// sweep finished executions.
fn spawn_cleanup(engine: Arc<WorkflowEngine>, config: &AppConfig) {
    let policy = config.retention_policy();
    let period = Duration::from_secs(config.cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = engine.cleanup(&policy).await;
            if !report.hitl.expired_pauses.is_empty()
                || report.hitl.interrupts_purged > 0
                || !report.swept.is_empty()
            {
                tracing::info!(
                    expired_pauses = report.hitl.expired_pauses.len(),
                    interrupts_purged = report.hitl.interrupts_purged,
                    swept = report.swept.len(),
                    "Cleanup pass finished"
                );
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    // Tracing depends on `log_json`, so a load failure is reported after init.
    let loaded = AppConfig::from_env();
    let app_config = loaded.as_ref().cloned().unwrap_or_default();
    init_tracing(app_config.log_json);
    if let Err(e) = &loaded {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting QueryGraph Orchestrator"
    );
    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        interrupt_store = ?app_config.interrupt_store,
        "Configuration loaded"
    );

    let (store, db_pool) = open_interrupt_store(&app_config).await?;

    let registry = Arc::new(ExecutionRegistry::new());
    let broadcaster = Arc::new(EventBroadcaster::new(registry.clone()));
    let hitl = Arc::new(HitlManager::new(store));

    let backend = Arc::new(HttpBackend::new(app_config.backend_url.clone()));
    tracing::info!(url = %backend.base_url(), "Collaborator backend configured");
    let collaborators = Collaborators {
        retriever: backend.clone(),
        reranker: backend.clone(),
        decider: backend.clone(),
        tool_backend: backend.clone(),
        augmenter: backend.clone(),
        synthesizer: backend,
    };
    let graph = WorkflowGraph::standard(collaborators, app_config.router_policy());

    let engine = Arc::new(
        WorkflowEngine::new(graph, registry, broadcaster, hitl)
            .with_collaborator_timeout(app_config.collaborator_timeout())
            .with_default_options(QueryOptions {
                retrieval_top_k: app_config.retrieval_top_k,
                rerank_top_n: app_config.rerank_top_n,
                ..QueryOptions::default()
            }),
    );

    spawn_cleanup(engine.clone(), &app_config);

    let state = AppState::new(engine, app_config.clone(), db_pool);
    let app = build_router(state);

    // Bind to address
    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    // Run the server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
