//! In-memory pause table.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::engine::state::{NodeName, WorkflowState};

/// Ephemeral snapshot of a paused execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseRecord {
    pub execution_id: String,
    pub state: WorkflowState,
    pub node: NodeName,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Paused executions keyed by execution id, guarded by a single mutex.
#[derive(Default)]
pub struct PauseTable {
    records: Mutex<HashMap<String, PauseRecord>>,
}

impl PauseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record, replacing any previous record of the execution.
    pub async fn insert(&self, record: PauseRecord) {
        self.records
            .lock()
            .await
            .insert(record.execution_id.clone(), record);
    }

    pub async fn get(&self, execution_id: &str) -> Option<PauseRecord> {
        self.records.lock().await.get(execution_id).cloned()
    }

    pub async fn contains(&self, execution_id: &str) -> bool {
        self.records.lock().await.contains_key(execution_id)
    }

    pub async fn remove(&self, execution_id: &str) -> Option<PauseRecord> {
        self.records.lock().await.remove(execution_id)
    }

    /// Drop records older than `max_age`, returning their execution ids.
    pub async fn expire(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<String> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut records = self.records.lock().await;
        let expired: Vec<String> = records
            .values()
            .filter(|r| now - r.created_at > max_age)
            .map(|r| r.execution_id.clone())
            .collect();
        for id in &expired {
            records.remove(id);
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}
