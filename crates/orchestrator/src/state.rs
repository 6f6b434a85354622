//! Shared application state passed to all handlers via Axum's state.

use std::sync::Arc;

use crate::broadcast::ControlDispatcher;
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::engine::WorkflowEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,

    /// Control message router shared by WebSocket sessions
    pub dispatcher: ControlDispatcher,

    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Database pool, absent with the in-memory interrupt store
    pub db: Option<DbPool>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: Arc<WorkflowEngine>, config: AppConfig, db: Option<DbPool>) -> Self {
        Self {
            dispatcher: ControlDispatcher::new(engine.clone()),
            engine,
            config: Arc::new(config),
            db,
            start_time: std::time::Instant::now(),
        }
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
