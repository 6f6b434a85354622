//! Parameter adjustment audit row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One field changed by a human override at resume time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ParameterAdjustment {
    /// Execution id of the suspended run.
    pub interrupt_id: String,
    /// Dotted path of the overridden field.
    pub parameter_name: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
