//! Execution registry.
//!
//! Owns the execution ↔ client association, the lifecycle status of every
//! known execution and the cooperative control flags the engine checks at
//! each node boundary. One instance is created at process start and shared
//! by the engine and the broadcaster.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::engine::state::{ExecutionStatus, NodeName};
use crate::hitl::SuspensionKind;

/// A pending pause/interrupt request for a running execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspendRequest {
    pub kind: SuspensionKind,
    pub reason: Option<String>,
    pub initiator: String,
    /// Only suspend when this node is about to run.
    pub before: Option<NodeName>,
}

/// What the engine must do before entering the next node.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    Proceed,
    Cancel { initiator: String },
    Suspend(SuspendRequest),
}

#[derive(Debug, Clone)]
struct ExecutionEntry {
    client_id: Option<String>,
    created_at: DateTime<Utc>,
    status: ExecutionStatus,
    evicted: bool,
    cancel_requested: Option<String>,
    suspend_requested: Option<SuspendRequest>,
}

/// Public view of a registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionInfo {
    pub execution_id: String,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub evicted: bool,
}

/// Registry of executions and client associations.
#[derive(Default)]
pub struct ExecutionRegistry {
    /// execution_id -> entry
    executions: RwLock<HashMap<String, ExecutionEntry>>,
    /// client_id -> live execution_id
    live: RwLock<HashMap<String, String>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new running execution for a client.
    ///
    /// Returns the client's previous live execution, which is marked evicted
    /// and removed by the next [`sweep`](Self::sweep).
    pub async fn register(&self, execution_id: &str, client_id: &str) -> Option<String> {
        let previous = self
            .live
            .write()
            .await
            .insert(client_id.to_string(), execution_id.to_string());

        let mut executions = self.executions.write().await;
        if let Some(prev) = previous.as_deref() {
            if let Some(entry) = executions.get_mut(prev) {
                entry.evicted = true;
            }
            info!(client_id = %client_id, evicted = %prev, "Evicted previous execution for client");
        }
        executions.insert(
            execution_id.to_string(),
            ExecutionEntry {
                client_id: Some(client_id.to_string()),
                created_at: Utc::now(),
                status: ExecutionStatus::Running,
                evicted: false,
                cancel_requested: None,
                suspend_requested: None,
            },
        );
        previous.filter(|p| p != execution_id)
    }

    /// Make `execution_id` the live execution of `client_id` again, creating
    /// the entry if it is unknown (e.g. an interrupt resumed after restart).
    pub async fn associate(&self, execution_id: &str, client_id: &str) {
        let previous = self
            .live
            .write()
            .await
            .insert(client_id.to_string(), execution_id.to_string());

        let mut executions = self.executions.write().await;
        if let Some(prev) = previous.as_deref().filter(|p| *p != execution_id) {
            if let Some(entry) = executions.get_mut(prev) {
                entry.evicted = true;
            }
        }
        let entry = executions
            .entry(execution_id.to_string())
            .or_insert_with(|| ExecutionEntry {
                client_id: None,
                created_at: Utc::now(),
                status: ExecutionStatus::Running,
                evicted: false,
                cancel_requested: None,
                suspend_requested: None,
            });
        entry.client_id = Some(client_id.to_string());
        entry.evicted = false;
    }

    /// Ensure an entry exists without binding a client.
    pub async fn ensure(&self, execution_id: &str) {
        self.executions
            .write()
            .await
            .entry(execution_id.to_string())
            .or_insert_with(|| ExecutionEntry {
                client_id: None,
                created_at: Utc::now(),
                status: ExecutionStatus::Running,
                evicted: false,
                cancel_requested: None,
                suspend_requested: None,
            });
    }

    /// The client currently subscribed to this execution, if it is still live.
    pub async fn client_for(&self, execution_id: &str) -> Option<String> {
        let client_id = self
            .executions
            .read()
            .await
            .get(execution_id)
            .and_then(|e| e.client_id.clone())?;

        let live = self.live.read().await;
        (live.get(&client_id).map(String::as_str) == Some(execution_id)).then_some(client_id)
    }

    pub async fn info(&self, execution_id: &str) -> Option<ExecutionInfo> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .map(|e| ExecutionInfo {
                execution_id: execution_id.to_string(),
                client_id: e.client_id.clone(),
                created_at: e.created_at,
                status: e.status,
                evicted: e.evicted,
            })
    }

    pub async fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.executions.read().await.get(execution_id).map(|e| e.status)
    }

    /// Set the lifecycle status. Leaving `running` clears pending control flags.
    pub async fn set_status(&self, execution_id: &str, status: ExecutionStatus) {
        if let Some(entry) = self.executions.write().await.get_mut(execution_id) {
            entry.status = status;
            if status != ExecutionStatus::Running {
                entry.cancel_requested = None;
                entry.suspend_requested = None;
            }
        }
    }

    /// Leave `running` for `status` in one step.
    ///
    /// Returns the initiator of a cancellation requested since the last
    /// control check. A pending suspension is dropped.
    pub async fn transition(&self, execution_id: &str, status: ExecutionStatus) -> Option<String> {
        let mut executions = self.executions.write().await;
        let entry = executions.get_mut(execution_id)?;
        entry.status = status;
        entry.suspend_requested = None;
        entry.cancel_requested.take()
    }

    /// Flag a running execution for cancellation. Returns `false` if it is not running.
    pub async fn request_cancel(&self, execution_id: &str, initiator: &str) -> bool {
        match self.executions.write().await.get_mut(execution_id) {
            Some(entry) if entry.status == ExecutionStatus::Running => {
                entry.cancel_requested = Some(initiator.to_string());
                debug!(execution_id = %execution_id, "Cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Flag a running execution for suspension. Returns `false` if it is not running.
    pub async fn request_suspend(&self, execution_id: &str, request: SuspendRequest) -> bool {
        match self.executions.write().await.get_mut(execution_id) {
            Some(entry) if entry.status == ExecutionStatus::Running => {
                debug!(execution_id = %execution_id, kind = ?request.kind, "Suspension requested");
                entry.suspend_requested = Some(request);
                true
            }
            _ => false,
        }
    }

    /// Consume the control flag applicable before entering `next`.
    ///
    /// Cancellation wins over suspension. A suspension targeted at another
    /// node stays pending.
    pub async fn take_signal(&self, execution_id: &str, next: NodeName) -> ControlSignal {
        let mut executions = self.executions.write().await;
        let Some(entry) = executions.get_mut(execution_id) else {
            return ControlSignal::Proceed;
        };
        if let Some(initiator) = entry.cancel_requested.take() {
            entry.suspend_requested = None;
            return ControlSignal::Cancel { initiator };
        }
        match entry.suspend_requested.as_ref().map(|r| r.before) {
            Some(None) => entry
                .suspend_requested
                .take()
                .map(ControlSignal::Suspend)
                .unwrap_or(ControlSignal::Proceed),
            Some(Some(target)) if target == next => entry
                .suspend_requested
                .take()
                .map(ControlSignal::Suspend)
                .unwrap_or(ControlSignal::Proceed),
            _ => ControlSignal::Proceed,
        }
    }

    /// Remove evicted executions that can no longer be resumed.
    pub async fn sweep(&self) -> Vec<String> {
        let mut executions = self.executions.write().await;
        let removable: Vec<String> = executions
            .iter()
            .filter(|(_, e)| e.evicted && e.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removable {
            executions.remove(id);
        }
        if !removable.is_empty() {
            debug!(count = removable.len(), "Swept evicted executions");
        }
        removable
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }
}
