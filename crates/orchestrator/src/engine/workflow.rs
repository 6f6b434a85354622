//! Workflow engine.
//!
//! Drives an execution through the graph one node at a time. Before each
//! node the registry is consulted for cancellation and suspension requests
//! and the state's breakpoints are checked; after each node its diagnostic
//! is recorded and lifecycle events are emitted to the execution's
//! subscriber.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{Event, EventBroadcaster, EventType};
use crate::db::models::{OperationType, ParameterAdjustment};
use crate::error::{AppError, AppResult};
use crate::hitl::{CleanupReport, HitlManager, ResumeOutcome, RetentionPolicy, SuspensionKind};
use crate::nodes::{NodeContext, NodeOutcome};
use crate::registry::{ControlSignal, ExecutionRegistry, SuspendRequest};
use crate::result_ext::OptionResultExt;

use super::graph::WorkflowGraph;
use super::state::{
    ExecutionStatus, HitlMetadata, HitlStatus, NodeDiagnostic, NodeName, NodeStatus, QueryOptions, ResumePoint,
    WorkflowState,
};
use super::store::{ExecutionSnapshot, ExecutionStateStore};

/// A new query.
#[derive(Debug, Clone)]
pub struct Submission {
    pub query: String,
    pub datasource_ref: Option<String>,
    pub client_id: String,
    pub options: Option<QueryOptions>,
}

/// Where an execution stopped: finished, failed, cancelled or suspended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub state: WorkflowState,
}

/// A resumed execution that has not re-entered the graph yet.
#[derive(Debug, Clone)]
pub struct PreparedResume {
    pub execution_id: String,
    pub kind: SuspensionKind,
    pub state: WorkflowState,
    /// First node to run; `None` when the suspended node was the last one.
    pub start: Option<NodeName>,
    pub adjustments: Vec<ParameterAdjustment>,
}

/// Result of [`WorkflowEngine::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The execution is running; it stops at the next node boundary.
    Requested,
    /// The suspended execution was cancelled.
    Cancelled,
}

/// Registry and state-store changes made by [`WorkflowEngine::cleanup`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineCleanup {
    pub hitl: CleanupReport,
    pub swept: Vec<String>,
}

pub struct WorkflowEngine {
    graph: WorkflowGraph,
    registry: Arc<ExecutionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    hitl: Arc<HitlManager>,
    states: ExecutionStateStore,
    collaborator_timeout: Option<Duration>,
    default_options: QueryOptions,
}

impl WorkflowEngine {
    pub fn new(
        graph: WorkflowGraph,
        registry: Arc<ExecutionRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        hitl: Arc<HitlManager>,
    ) -> Self {
        Self {
            graph,
            registry,
            broadcaster,
            hitl,
            states: ExecutionStateStore::new(),
            collaborator_timeout: None,
            default_options: QueryOptions::default(),
        }
    }

    pub fn with_collaborator_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.collaborator_timeout = timeout;
        self
    }

    /// Options used when a submission carries none.
    pub fn with_default_options(mut self, options: QueryOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn hitl(&self) -> &Arc<HitlManager> {
        &self.hitl
    }

    pub fn states(&self) -> &ExecutionStateStore {
        &self.states
    }

    pub async fn snapshot(&self, execution_id: &str) -> Option<ExecutionSnapshot> {
        self.states.get(execution_id).await
    }

    /// Run a new query to completion or suspension.
    pub async fn submit(&self, submission: Submission) -> ExecutionResult {
        let (execution_id, state) = self.begin(submission).await;
        self.drive(&execution_id, state, Some(self.graph.entry()), None)
            .await
    }

    /// Start a new query on its own task. The execution id is known before
    /// the first node runs.
    pub async fn spawn(self: &Arc<Self>, submission: Submission) -> (String, JoinHandle<ExecutionResult>) {
        let (execution_id, state) = self.begin(submission).await;
        let engine = Arc::clone(self);
        let id = execution_id.clone();
        let handle = tokio::spawn(async move {
            let entry = engine.graph.entry();
            engine.drive(&id, state, Some(entry), None).await
        });
        (execution_id, handle)
    }

    async fn begin(&self, submission: Submission) -> (String, WorkflowState) {
        let execution_id = Uuid::new_v4().to_string();
        if let Some(previous) = self
            .registry
            .register(&execution_id, &submission.client_id)
            .await
        {
            debug!(execution_id = %execution_id, previous = %previous, "Client moved to a new execution");
        }

        let options = submission
            .options
            .unwrap_or_else(|| self.default_options.clone());
        let state = WorkflowState::new(submission.query, submission.datasource_ref, options);

        info!(execution_id = %execution_id, client_id = %submission.client_id, "Execution started");
        self.emit(
            &execution_id,
            Event::new(EventType::ExecutionStarted, &execution_id).with_data(json!({
                "query": state.query,
                "datasource_ref": state.datasource_ref,
                "client_id": submission.client_id,
            })),
        )
        .await;
        (execution_id, state)
    }

    /// Release a suspended execution and prepare its re-entry point.
    ///
    /// `client_id`, when given, becomes the subscriber of the execution.
    pub async fn prepare_resume(
        &self,
        execution_id: &str,
        overrides: Option<&BTreeMap<String, Value>>,
        reason: Option<&str>,
        client_id: Option<&str>,
        initiator: &str,
    ) -> AppResult<PreparedResume> {
        let resumed = match self
            .hitl
            .resume(execution_id, overrides, reason, initiator)
            .await
        {
            ResumeOutcome::Resumed(resumed) => *resumed,
            ResumeOutcome::NotFound => {
                return Err(AppError::NotFound(format!(
                    "No paused or interrupted execution {}",
                    execution_id
                )))
            }
            ResumeOutcome::Rejected(msg) => return Err(AppError::Validation(msg)),
            ResumeOutcome::Failed(msg) => return Err(AppError::Store(msg)),
        };

        match client_id {
            Some(client_id) => self.registry.associate(execution_id, client_id).await,
            None => self.registry.ensure(execution_id).await,
        }
        self.registry
            .set_status(execution_id, ExecutionStatus::Running)
            .await;

        let point = resumed
            .state
            .hitl
            .as_ref()
            .map(|h| h.resume)
            .log_none(format!("resume point of {}", execution_id))
            .unwrap_or(ResumePoint::At(resumed.node));
        let start = self.graph.resolve(point, &resumed.state);

        info!(
            execution_id = %execution_id,
            kind = %resumed.kind,
            resume_at = ?start,
            adjustments = resumed.adjustments.len(),
            "Execution resumed"
        );
        self.emit(
            execution_id,
            Event::new(EventType::HitlResumed, execution_id)
                .with_node(resumed.node)
                .with_data(json!({
                    "kind": resumed.kind,
                    "resume_at": start,
                    "adjustments": resumed.adjustments,
                })),
        )
        .await;

        Ok(PreparedResume {
            execution_id: execution_id.to_string(),
            kind: resumed.kind,
            state: resumed.state,
            start,
            adjustments: resumed.adjustments,
        })
    }

    /// Drive a prepared resume to completion or the next suspension.
    pub async fn continue_resume(&self, prepared: PreparedResume) -> ExecutionResult {
        self.drive(&prepared.execution_id, prepared.state, prepared.start, prepared.start)
            .await
    }

    pub async fn resume(
        &self,
        execution_id: &str,
        overrides: Option<&BTreeMap<String, Value>>,
        reason: Option<&str>,
        client_id: Option<&str>,
        initiator: &str,
    ) -> AppResult<ExecutionResult> {
        let prepared = self
            .prepare_resume(execution_id, overrides, reason, client_id, initiator)
            .await?;
        Ok(self.continue_resume(prepared).await)
    }

    /// Ask a running execution to suspend at its next node boundary.
    pub async fn request_suspend(&self, execution_id: &str, request: SuspendRequest) -> AppResult<()> {
        match self.registry.status(execution_id).await {
            None => Err(AppError::NotFound(format!("Unknown execution {}", execution_id))),
            Some(ExecutionStatus::Running) => {
                if self.registry.request_suspend(execution_id, request).await {
                    Ok(())
                } else {
                    Err(AppError::Conflict(format!("Execution {} is no longer running", execution_id)))
                }
            }
            Some(status) => Err(AppError::Conflict(format!(
                "Execution {} is {}",
                execution_id, status
            ))),
        }
    }

    /// Cancel a running or suspended execution.
    pub async fn cancel(&self, execution_id: &str, initiator: &str) -> AppResult<CancelOutcome> {
        if self.registry.request_cancel(execution_id, initiator).await {
            return Ok(CancelOutcome::Requested);
        }

        let not_found = || AppError::NotFound(format!("No running or suspended execution {}", execution_id));
        let kind = self.hitl.locate(execution_id).await?.ok_or_else(not_found)?;
        if !self.hitl.cancel(execution_id, kind, initiator).await {
            return Err(not_found());
        }

        self.registry.ensure(execution_id).await;
        self.registry
            .set_status(execution_id, ExecutionStatus::Cancelled)
            .await;

        let mut event = Event::new(EventType::HitlCancelled, execution_id).with_data(json!({ "kind": kind }));
        if let Some(snapshot) = self.states.get(execution_id).await {
            let mut state = snapshot.state;
            if let Some(hitl) = state.hitl.as_mut() {
                hitl.status = HitlStatus::Cancelled;
                hitl.timestamp = Utc::now();
                event = event.with_node(hitl.node);
            }
            self.states
                .set(execution_id, ExecutionStatus::Cancelled, &state)
                .await;
        }

        info!(execution_id = %execution_id, kind = %kind, "Suspended execution cancelled");
        self.emit(execution_id, event).await;
        Ok(CancelOutcome::Cancelled)
    }

    /// Expire old suspensions and drop evicted, finished executions.
    pub async fn cleanup(&self, policy: &RetentionPolicy) -> EngineCleanup {
        let hitl = self.hitl.cleanup(policy).await;
        for execution_id in &hitl.expired_pauses {
            self.registry
                .set_status(execution_id, ExecutionStatus::Cancelled)
                .await;
            self.states
                .set_status(execution_id, ExecutionStatus::Cancelled)
                .await;
            self.emit(
                execution_id,
                Event::new(EventType::HitlCancelled, execution_id)
                    .with_data(json!({ "kind": SuspensionKind::Pause, "reason": "pause expired" })),
            )
            .await;
        }

        let swept = self.registry.sweep().await;
        for execution_id in &swept {
            self.states.remove(execution_id).await;
        }
        EngineCleanup { hitl, swept }
    }

    async fn drive(
        &self,
        execution_id: &str,
        mut state: WorkflowState,
        start: Option<NodeName>,
        resume_entry: Option<NodeName>,
    ) -> ExecutionResult {
        let ctx = NodeContext::new(execution_id, self.broadcaster.clone(), self.collaborator_timeout);
        let mut skip_breakpoint = resume_entry;
        let mut current = start;

        while let Some(node_name) = current {
            match self.registry.take_signal(execution_id, node_name).await {
                ControlSignal::Proceed => {}
                ControlSignal::Cancel { initiator } => {
                    return self
                        .finish_cancelled(execution_id, state, node_name, &initiator)
                        .await;
                }
                ControlSignal::Suspend(request) => {
                    return self
                        .suspend(
                            execution_id,
                            state,
                            node_name,
                            ResumePoint::At(node_name),
                            request.kind,
                            request.reason,
                            &request.initiator,
                        )
                        .await;
                }
            }

            if skip_breakpoint.take() != Some(node_name) {
                if let Some(kind) = breakpoint(&state.options, node_name) {
                    return self
                        .suspend(
                            execution_id,
                            state,
                            node_name,
                            ResumePoint::At(node_name),
                            kind,
                            Some(format!("breakpoint before {}", node_name)),
                            "breakpoint",
                        )
                        .await;
                }
            }

            let Some(node) = self.graph.node(node_name).cloned() else {
                let error = format!("Node {} is not part of the graph", node_name);
                return self.finish_error(execution_id, state, Some(node_name), error).await;
            };

            debug!(execution_id = %execution_id, node = %node_name, "Node started");
            self.emit(
                execution_id,
                Event::new(EventType::NodeStarted, execution_id).with_node(node_name),
            )
            .await;

            let started_at = Utc::now();
            let timer = Instant::now();
            let outcome = node.run(&state, &ctx).await;
            let duration_ms = timer.elapsed().as_millis() as u64;
            let diagnostic = |status: NodeStatus, error: Option<String>| NodeDiagnostic {
                status,
                started_at,
                duration_ms,
                error,
                notes: Vec::new(),
            };

            match outcome {
                NodeOutcome::Continue(mut next) => {
                    next.record_node(node_name, diagnostic(NodeStatus::Completed, None));
                    self.node_completed(execution_id, &next, node_name, duration_ms)
                        .await;
                    state = next;
                    current = self.graph.next(node_name, &state);
                }
                NodeOutcome::Suspend {
                    state: mut next,
                    kind,
                    reason,
                } => {
                    next.record_node(node_name, diagnostic(NodeStatus::Suspended, None));
                    self.node_completed(execution_id, &next, node_name, duration_ms)
                        .await;
                    return self
                        .suspend(
                            execution_id,
                            next,
                            node_name,
                            ResumePoint::After(node_name),
                            kind,
                            reason,
                            "system",
                        )
                        .await;
                }
                NodeOutcome::Fail(error) => {
                    let message = error.to_string();
                    warn!(execution_id = %execution_id, node = %node_name, error = %message, "Node failed");
                    self.emit(
                        execution_id,
                        Event::new(EventType::NodeError, execution_id)
                            .with_node(node_name)
                            .with_duration(duration_ms)
                            .with_error(message.clone()),
                    )
                    .await;

                    match node.degrade(&state, &error) {
                        Some(mut next) => {
                            info!(execution_id = %execution_id, node = %node_name, "Node degraded, continuing");
                            next.record_node(node_name, diagnostic(NodeStatus::Degraded, Some(message)));
                            state = next;
                            current = self.graph.next(node_name, &state);
                        }
                        None => {
                            state.record_node(node_name, diagnostic(NodeStatus::Failed, Some(message.clone())));
                            return self
                                .finish_error(execution_id, state, Some(node_name), message)
                                .await;
                        }
                    }
                }
            }
        }

        self.finish_completed(execution_id, state).await
    }

    async fn node_completed(&self, execution_id: &str, state: &WorkflowState, node: NodeName, duration_ms: u64) {
        let mut event = Event::new(EventType::NodeCompleted, execution_id)
            .with_node(node)
            .with_duration(duration_ms);
        if let Some(output) = state.stage_output(node) {
            event = event.with_data(output);
        }
        self.emit(execution_id, event).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn suspend(
        &self,
        execution_id: &str,
        mut state: WorkflowState,
        node: NodeName,
        resume: ResumePoint,
        kind: SuspensionKind,
        reason: Option<String>,
        initiator: &str,
    ) -> ExecutionResult {
        state.hitl = Some(HitlMetadata {
            status: match kind {
                SuspensionKind::Pause => HitlStatus::Paused,
                SuspensionKind::Interrupt => HitlStatus::Interrupted,
            },
            node,
            reason: reason.clone(),
            timestamp: Utc::now(),
            resume,
        });

        let durable = kind == SuspensionKind::Interrupt
            && self
                .hitl
                .interrupt(execution_id, &state, node, reason.as_deref(), initiator)
                .await;
        let kind = if durable {
            SuspensionKind::Interrupt
        } else {
            if kind == SuspensionKind::Interrupt {
                warn!(execution_id = %execution_id, "Durable interrupt failed, falling back to pause");
                if let Some(hitl) = state.hitl.as_mut() {
                    hitl.status = HitlStatus::Paused;
                }
            }
            self.hitl
                .pause(execution_id, &state, node, reason.as_deref(), initiator)
                .await;
            SuspensionKind::Pause
        };

        let (status, event_type) = match kind {
            SuspensionKind::Pause => (ExecutionStatus::Paused, EventType::HitlPaused),
            SuspensionKind::Interrupt => (ExecutionStatus::Interrupted, EventType::HitlInterrupted),
        };
        if let Some(canceller) = self.registry.transition(execution_id, status).await {
            return self
                .cancel_suspended(execution_id, state, node, kind, &canceller)
                .await;
        }
        self.states.set(execution_id, status, &state).await;

        self.emit(
            execution_id,
            Event::new(event_type, execution_id)
                .with_node(node)
                .with_data(json!({ "kind": kind, "reason": reason, "resume": resume })),
        )
        .await;

        ExecutionResult {
            execution_id: execution_id.to_string(),
            status,
            state,
        }
    }

    /// Cancel a suspension whose record was written while a cancellation
    /// was already pending.
    async fn cancel_suspended(
        &self,
        execution_id: &str,
        mut state: WorkflowState,
        node: NodeName,
        kind: SuspensionKind,
        initiator: &str,
    ) -> ExecutionResult {
        if !self.hitl.cancel(execution_id, kind, initiator).await {
            warn!(execution_id = %execution_id, kind = %kind, "Suspension record was not cancelled");
        }
        if let Some(hitl) = state.hitl.as_mut() {
            hitl.status = HitlStatus::Cancelled;
            hitl.timestamp = Utc::now();
        }
        self.registry
            .set_status(execution_id, ExecutionStatus::Cancelled)
            .await;
        self.states
            .set(execution_id, ExecutionStatus::Cancelled, &state)
            .await;

        info!(execution_id = %execution_id, node = %node, kind = %kind, "Execution cancelled while suspending");
        self.emit(
            execution_id,
            Event::new(EventType::HitlCancelled, execution_id)
                .with_node(node)
                .with_data(json!({ "kind": kind })),
        )
        .await;

        ExecutionResult {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Cancelled,
            state,
        }
    }

    async fn finish_cancelled(
        &self,
        execution_id: &str,
        mut state: WorkflowState,
        node: NodeName,
        initiator: &str,
    ) -> ExecutionResult {
        state.hitl = Some(HitlMetadata {
            status: HitlStatus::Cancelled,
            node,
            reason: None,
            timestamp: Utc::now(),
            resume: ResumePoint::At(node),
        });
        self.registry
            .set_status(execution_id, ExecutionStatus::Cancelled)
            .await;
        self.states
            .set(execution_id, ExecutionStatus::Cancelled, &state)
            .await;
        self.hitl
            .record_history(execution_id, OperationType::Cancel, Some(node), json!({}), initiator)
            .await;

        info!(execution_id = %execution_id, node = %node, "Execution cancelled");
        self.emit(
            execution_id,
            Event::new(EventType::HitlCancelled, execution_id).with_node(node),
        )
        .await;

        ExecutionResult {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Cancelled,
            state,
        }
    }

    async fn finish_error(
        &self,
        execution_id: &str,
        state: WorkflowState,
        node: Option<NodeName>,
        error: String,
    ) -> ExecutionResult {
        if let Some(initiator) = self
            .registry
            .transition(execution_id, ExecutionStatus::Error)
            .await
        {
            debug!(execution_id = %execution_id, initiator = %initiator, "Cancellation arrived after the last node");
        }
        self.states
            .set(execution_id, ExecutionStatus::Error, &state)
            .await;

        let mut event = Event::new(EventType::ExecutionError, execution_id).with_error(error);
        if let Some(node) = node {
            event = event.with_node(node);
        }
        self.emit(execution_id, event).await;

        ExecutionResult {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Error,
            state,
        }
    }

    async fn finish_completed(&self, execution_id: &str, state: WorkflowState) -> ExecutionResult {
        if let Some(initiator) = self
            .registry
            .transition(execution_id, ExecutionStatus::Completed)
            .await
        {
            debug!(execution_id = %execution_id, initiator = %initiator, "Cancellation arrived after the last node");
        }
        self.states
            .set(execution_id, ExecutionStatus::Completed, &state)
            .await;

        info!(execution_id = %execution_id, "Execution completed");
        self.emit(
            execution_id,
            Event::new(EventType::ExecutionCompleted, execution_id).with_data(json!({
                "answer": state.answer,
                "augmentation": state.augmentation,
            })),
        )
        .await;

        ExecutionResult {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Completed,
            state,
        }
    }

    async fn emit(&self, execution_id: &str, event: Event) {
        self.broadcaster.broadcast(execution_id, event).await;
    }
}

/// Breakpoint configured before `node`. Interrupts win over pauses.
fn breakpoint(options: &QueryOptions, node: NodeName) -> Option<SuspensionKind> {
    if options.interrupt_before.contains(&node) {
        Some(SuspensionKind::Interrupt)
    } else if options.pause_before.contains(&node) {
        Some(SuspensionKind::Pause)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_prefers_interrupt() {
        let options = QueryOptions {
            pause_before: vec![NodeName::Synthesize, NodeName::Route],
            interrupt_before: vec![NodeName::Synthesize],
            ..QueryOptions::default()
        };
        assert_eq!(breakpoint(&options, NodeName::Synthesize), Some(SuspensionKind::Interrupt));
        assert_eq!(breakpoint(&options, NodeName::Route), Some(SuspensionKind::Pause));
        assert_eq!(breakpoint(&options, NodeName::Retrieve), None);
    }
}
