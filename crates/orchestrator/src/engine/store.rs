//! Last known state of every execution, for status polling and replay.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::state::{ExecutionStatus, WorkflowState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub state: WorkflowState,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide `execution_id -> snapshot` table. Last writer wins.
#[derive(Default)]
pub struct ExecutionStateStore {
    snapshots: RwLock<HashMap<String, ExecutionSnapshot>>,
}

impl ExecutionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, execution_id: &str, status: ExecutionStatus, state: &WorkflowState) {
        self.snapshots.write().await.insert(
            execution_id.to_string(),
            ExecutionSnapshot {
                execution_id: execution_id.to_string(),
                status,
                state: state.clone(),
                updated_at: Utc::now(),
            },
        );
    }

    pub async fn get(&self, execution_id: &str) -> Option<ExecutionSnapshot> {
        self.snapshots.read().await.get(execution_id).cloned()
    }

    /// Change only the status of an existing snapshot.
    pub async fn set_status(&self, execution_id: &str, status: ExecutionStatus) -> bool {
        match self.snapshots.write().await.get_mut(execution_id) {
            Some(snapshot) => {
                snapshot.status = status;
                snapshot.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, execution_id: &str) -> Option<ExecutionSnapshot> {
        self.snapshots.write().await.remove(execution_id)
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::QueryOptions;

    #[test]
    fn test_last_writer_wins() {
        tokio_test::block_on(async {
            let store = ExecutionStateStore::new();
            let state = WorkflowState::new("q", None, QueryOptions::default());
            store.set("e1", ExecutionStatus::Paused, &state).await;
            store.set("e1", ExecutionStatus::Completed, &state).await;

            let snapshot = store.get("e1").await.unwrap();
            assert_eq!(snapshot.status, ExecutionStatus::Completed);
            assert_eq!(store.len().await, 1);
            assert!(store.get("e2").await.is_none());
        });
    }

    #[tokio::test]
    async fn test_set_status_requires_snapshot() {
        let store = ExecutionStateStore::new();
        assert!(!store.set_status("e1", ExecutionStatus::Cancelled).await);
        store
            .set("e1", ExecutionStatus::Paused, &WorkflowState::new("q", None, QueryOptions::default()))
            .await;
        assert!(store.set_status("e1", ExecutionStatus::Cancelled).await);
        assert_eq!(store.get("e1").await.unwrap().status, ExecutionStatus::Cancelled);
    }
}
