//! Application configuration for the QueryGraph orchestrator.

use std::time::Duration;

use serde::Deserialize;

use crate::hitl::RetentionPolicy;
use crate::nodes::router::RouterPolicy;

/// Backend used to persist interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptStoreKind {
    /// PostgreSQL tables (durable across restarts).
    Postgres,
    /// Process memory. Interrupts are lost on restart.
    Memory,
}

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `QUERYGRAPH_`:
/// - `QUERYGRAPH_HOST`: Server bind address (default: "0.0.0.0")
/// - `QUERYGRAPH_PORT`: Server port (default: 8084)
/// - `QUERYGRAPH_BACKEND_URL`: Base URL of the collaborator backend
/// - `QUERYGRAPH_INTERRUPT_STORE`: `postgres` or `memory` (default: postgres)
/// - `QUERYGRAPH_PAUSE_TTL_SECS`: Max age of in-memory pauses
/// - `QUERYGRAPH_INTERRUPT_RETENTION_SECS`: Retention of cancelled interrupts
/// - `QUERYGRAPH_HEURISTIC_THRESHOLD`: Confidence needed for a router override
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    /// Base URL of the retrieval/generation/tool backend
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Where interrupts are persisted
    #[serde(default = "default_interrupt_store")]
    pub interrupt_store: InterruptStoreKind,

    /// Timeout applied to each collaborator call (seconds, optional)
    #[serde(default)]
    pub collaborator_timeout_secs: Option<u64>,

    /// Number of items requested from the retriever
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    /// Number of items kept after reranking
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,

    /// Max age of an in-memory pause before cleanup (seconds)
    #[serde(default = "default_pause_ttl")]
    pub pause_ttl_secs: u64,

    /// Retention of cancelled interrupts before purge (seconds)
    #[serde(default = "default_interrupt_retention")]
    pub interrupt_retention_secs: u64,

    /// Interval of the background cleanup task (seconds)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Allow the router heuristic to override the primary decision
    #[serde(default = "default_true")]
    pub heuristic_override: bool,

    /// Heuristic confidence required for an override
    #[serde(default = "default_heuristic_threshold")]
    pub heuristic_threshold: f64,

    /// Interrupt for human review when the router confidence is below this value
    #[serde(default)]
    pub review_below_confidence: Option<f64>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8084
}

fn default_server_name() -> String {
    "querygraph-orchestrator".to_string()
}

fn default_backend_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_interrupt_store() -> InterruptStoreKind {
    InterruptStoreKind::Postgres
}

fn default_retrieval_top_k() -> usize {
    20
}

fn default_rerank_top_n() -> usize {
    5
}

fn default_pause_ttl() -> u64 {
    3600
}

fn default_interrupt_retention() -> u64 {
    7 * 24 * 3600
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_heuristic_threshold() -> f64 {
    0.8
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `QUERYGRAPH_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("QUERYGRAPH_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Router policy derived from the heuristic settings.
    pub fn router_policy(&self) -> RouterPolicy {
        RouterPolicy {
            heuristic_override: self.heuristic_override,
            heuristic_threshold: self.heuristic_threshold,
            review_below_confidence: self.review_below_confidence,
        }
    }

    /// Retention windows used by the cleanup task.
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            pause_max_age: Duration::from_secs(self.pause_ttl_secs),
            interrupt_retention: Duration::from_secs(self.interrupt_retention_secs),
        }
    }

    pub fn collaborator_timeout(&self) -> Option<Duration> {
        self.collaborator_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            server_name: default_server_name(),
            log_json: false,
            backend_url: default_backend_url(),
            interrupt_store: default_interrupt_store(),
            collaborator_timeout_secs: None,
            retrieval_top_k: default_retrieval_top_k(),
            rerank_top_n: default_rerank_top_n(),
            pause_ttl_secs: default_pause_ttl(),
            interrupt_retention_secs: default_interrupt_retention(),
            cleanup_interval_secs: default_cleanup_interval(),
            heuristic_override: true,
            heuristic_threshold: default_heuristic_threshold(),
            review_below_confidence: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8084);
        assert_eq!(config.interrupt_store, InterruptStoreKind::Postgres);
        assert!(!config.debug);
    }

    #[test]
    fn test_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8084");
    }

    #[test]
    fn test_pause_and_interrupt_windows_are_independent() {
        let config = AppConfig {
            pause_ttl_secs: 60,
            interrupt_retention_secs: 600,
            ..AppConfig::default()
        };
        let policy = config.retention_policy();
        assert_eq!(policy.pause_max_age, Duration::from_secs(60));
        assert_eq!(policy.interrupt_retention, Duration::from_secs(600));
    }

    #[test]
    fn test_router_policy_from_config() {
        let config = AppConfig {
            heuristic_threshold: 0.65,
            review_below_confidence: Some(0.3),
            ..AppConfig::default()
        };
        let policy = config.router_policy();
        assert!(policy.heuristic_override);
        assert_eq!(policy.heuristic_threshold, 0.65);
        assert_eq!(policy.review_below_confidence, Some(0.3));
    }
}
