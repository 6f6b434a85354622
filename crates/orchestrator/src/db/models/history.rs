//! Execution history audit row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::engine::state::NodeName;

/// Control operation recorded in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Pause,
    Interrupt,
    Resume,
    Cancel,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Interrupt => "interrupt",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of `querygraph.execution_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct HistoryEntry {
    pub execution_id: String,
    pub operation_type: String,
    pub node_name: Option<String>,
    pub parameters_blob: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub initiator: String,
}

impl HistoryEntry {
    pub fn new(
        execution_id: &str,
        operation: OperationType,
        node: Option<NodeName>,
        parameters: serde_json::Value,
        initiator: &str,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            operation_type: operation.to_string(),
            node_name: node.map(|n| n.to_string()),
            parameters_blob: parameters,
            timestamp: Utc::now(),
            initiator: initiator.to_string(),
        }
    }
}
