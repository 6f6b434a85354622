//! Durable interrupt record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::engine::state::NodeName;
use crate::error::StateError;

/// Status of a durable interrupt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptStatus {
    /// Waiting for a resume or cancel
    Interrupted,
    /// Resumed once; kept for audit
    Resumed,
    /// Cancelled; purged after the retention window
    Cancelled,
}

impl InterruptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupted => "interrupted",
            Self::Resumed => "resumed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InterruptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InterruptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interrupted" => Ok(Self::Interrupted),
            "resumed" => Ok(Self::Resumed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown interrupt status '{}'", other)),
        }
    }
}

/// Row of `querygraph.interrupts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InterruptRecord {
    pub id: i64,
    pub execution_id: String,
    pub user_input: String,
    pub datasource_ref: Option<String>,
    pub interrupt_node: String,
    pub interrupt_reason: Option<String>,
    /// Serialized `WorkflowState`.
    pub state_blob: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InterruptRecord {
    pub fn status(&self) -> Option<InterruptStatus> {
        self.status.parse().ok()
    }

    pub fn node(&self) -> Result<NodeName, StateError> {
        self.interrupt_node.parse()
    }
}

/// Values for inserting (or replacing) an interrupt record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInterrupt {
    pub execution_id: String,
    pub user_input: String,
    pub datasource_ref: Option<String>,
    pub interrupt_node: NodeName,
    pub interrupt_reason: Option<String>,
    pub state_blob: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            InterruptStatus::Interrupted,
            InterruptStatus::Resumed,
            InterruptStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<InterruptStatus>().unwrap(), status);
        }
        assert!("paused".parse::<InterruptStatus>().is_err());
    }
}
