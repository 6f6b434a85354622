//! Inbound control protocol.
//!
//! Clients send `{type, execution_id, node_name?, reason?, parameters?,
//! timestamp?}` over their event channel. Replies are regular `hitl_*`
//! events; failures are reported to the sender as `execution_error`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::state::NodeName;
use crate::engine::{ExecutionResult, WorkflowEngine};
use crate::error::AppError;
use crate::hitl::SuspensionKind;
use crate::registry::SuspendRequest;

use super::events::{Event, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    #[serde(alias = "pause")]
    HitlPause,
    #[serde(alias = "interrupt")]
    HitlInterrupt,
    #[serde(alias = "resume")]
    HitlResume,
    #[serde(alias = "cancel")]
    HitlCancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: ControlType,
    pub execution_id: String,
    /// Suspend only before this node (pause/interrupt).
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Overrides applied on resume, keyed by dotted state path.
    #[serde(default)]
    pub parameters: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// What the dispatcher did with a message.
#[derive(Debug)]
pub enum ControlReply {
    /// Request registered; the matching `hitl_*` event follows.
    Accepted,
    /// Execution resumed on its own task.
    Resumed(JoinHandle<ExecutionResult>),
    Rejected(String),
    NotFound(String),
}

/// Routes control messages to the engine.
#[derive(Clone)]
pub struct ControlDispatcher {
    engine: Arc<WorkflowEngine>,
}

impl ControlDispatcher {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Decode and dispatch one raw text frame.
    pub async fn handle_text(&self, client_id: &str, text: &str) -> ControlReply {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(message) => self.dispatch(client_id, message).await,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Invalid control message");
                let reason = format!("Invalid control message: {}", e);
                self.report(client_id, "", &reason).await;
                ControlReply::Rejected(reason)
            }
        }
    }

    pub async fn dispatch(&self, client_id: &str, message: ControlMessage) -> ControlReply {
        debug!(
            client_id = %client_id,
            execution_id = %message.execution_id,
            kind = ?message.kind,
            "Control message received"
        );
        let initiator = format!("client:{}", client_id);
        let execution_id = message.execution_id.as_str();

        let reply = match message.kind {
            ControlType::HitlPause | ControlType::HitlInterrupt => {
                let kind = if message.kind == ControlType::HitlPause {
                    SuspensionKind::Pause
                } else {
                    SuspensionKind::Interrupt
                };
                match message.node_name.as_deref().map(str::parse::<NodeName>).transpose() {
                    Ok(before) => {
                        let request = SuspendRequest {
                            kind,
                            reason: message.reason.clone(),
                            initiator,
                            before,
                        };
                        match self.engine.request_suspend(execution_id, request).await {
                            Ok(()) => ControlReply::Accepted,
                            Err(e) => error_reply(e),
                        }
                    }
                    Err(e) => ControlReply::Rejected(e.to_string()),
                }
            }
            ControlType::HitlResume => {
                match self
                    .engine
                    .prepare_resume(
                        execution_id,
                        message.parameters.as_ref(),
                        message.reason.as_deref(),
                        Some(client_id),
                        &initiator,
                    )
                    .await
                {
                    Ok(prepared) => {
                        let engine = self.engine.clone();
                        ControlReply::Resumed(tokio::spawn(async move { engine.continue_resume(prepared).await }))
                    }
                    Err(e) => error_reply(e),
                }
            }
            ControlType::HitlCancel => match self.engine.cancel(execution_id, &initiator).await {
                Ok(_) => ControlReply::Accepted,
                Err(e) => error_reply(e),
            },
        };

        if let ControlReply::Rejected(reason) | ControlReply::NotFound(reason) = &reply {
            self.report(client_id, execution_id, reason).await;
        }
        reply
    }

    async fn report(&self, client_id: &str, execution_id: &str, reason: &str) {
        self.engine
            .broadcaster()
            .send_to_client(
                client_id,
                Event::new(EventType::ExecutionError, execution_id).with_error(reason),
            )
            .await;
    }
}

fn error_reply(error: AppError) -> ControlReply {
    match error {
        AppError::NotFound(msg) => ControlReply::NotFound(msg),
        other => ControlReply::Rejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::EventBroadcaster;
    use crate::engine::WorkflowGraph;
    use crate::hitl::{HitlManager, MemoryInterruptStore};
    use crate::registry::ExecutionRegistry;

    fn dispatcher() -> ControlDispatcher {
        let registry = Arc::new(ExecutionRegistry::new());
        let broadcaster = Arc::new(EventBroadcaster::new(registry.clone()));
        let hitl = Arc::new(HitlManager::new(Arc::new(MemoryInterruptStore::new())));
        let engine = WorkflowEngine::new(WorkflowGraph::new(NodeName::Retrieve), registry, broadcaster, hitl);
        ControlDispatcher::new(Arc::new(engine))
    }

    #[test]
    fn test_message_accepts_short_type_names() {
        let message: ControlMessage = serde_json::from_str(
            r#"{"type": "resume", "execution_id": "e1", "parameters": {"options.output_format": "csv"}}"#,
        )
        .unwrap();
        assert_eq!(message.kind, ControlType::HitlResume);
        assert_eq!(message.parameters.unwrap()["options.output_format"], "csv");

        let message: ControlMessage =
            serde_json::from_str(r#"{"type": "hitl_pause", "execution_id": "e1", "node_name": "route"}"#).unwrap();
        assert_eq!(message.kind, ControlType::HitlPause);
    }

    #[tokio::test]
    async fn test_resume_unknown_execution_reports_not_found() {
        let dispatcher = dispatcher();
        let mut sub = dispatcher.engine().broadcaster().connect("c").await;

        let reply = dispatcher
            .handle_text("c", r#"{"type": "hitl_resume", "execution_id": "missing"}"#)
            .await;
        assert!(matches!(reply, ControlReply::NotFound(_)));

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ExecutionError);
        assert_eq!(event.execution_id, "missing");
    }

    #[tokio::test]
    async fn test_invalid_node_name_is_rejected() {
        let dispatcher = dispatcher();
        let reply = dispatcher
            .handle_text("c", r#"{"type": "hitl_pause", "execution_id": "e1", "node_name": "nowhere"}"#)
            .await;
        assert!(matches!(reply, ControlReply::Rejected(_)));
    }
}
