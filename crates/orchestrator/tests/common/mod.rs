#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;

use querygraph_orchestrator::broadcast::{Event, EventBroadcaster, EventType, TokenSink};
use querygraph_orchestrator::engine::state::{Augmentation, Decision, DecisionSource, RetrievedItem, ToolOutput};
use querygraph_orchestrator::engine::{QueryOptions, Submission, WorkflowEngine, WorkflowGraph};
use querygraph_orchestrator::db::models::{
    HistoryEntry, InterruptRecord, InterruptStatus, NewInterrupt, ParameterAdjustment,
};
use querygraph_orchestrator::error::{AppResult, CollaboratorError};
use querygraph_orchestrator::hitl::{HitlManager, InterruptStore, MemoryInterruptStore};
use querygraph_orchestrator::nodes::RouterPolicy;
use querygraph_orchestrator::registry::ExecutionRegistry;
use querygraph_orchestrator::services::{
    Augmenter, Collaborators, DecisionProvider, Reranker, Retriever, SynthesisRequest, Synthesizer, ToolBackend,
    ToolRequest, ToolResult,
};

pub struct FakeRetriever;

#[async_trait]
impl Retriever for FakeRetriever {
    async fn retrieve(
        &self,
        query: &str,
        _datasource_ref: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<RetrievedItem>, CollaboratorError> {
        Ok((0..top_k.min(4))
            .map(|i| RetrievedItem {
                id: format!("doc-{}", i),
                content: format!("{} (passage {})", query, i),
                score: 0.7 - 0.1 * i as f64,
                metadata: Value::Null,
            })
            .collect())
    }
}

/// Blocks inside the retrieve stage until released.
pub struct GatedRetriever {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl Retriever for GatedRetriever {
    async fn retrieve(
        &self,
        query: &str,
        datasource_ref: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<RetrievedItem>, CollaboratorError> {
        self.started.notify_one();
        self.release.notified().await;
        FakeRetriever.retrieve(query, datasource_ref, top_k).await
    }
}

pub struct FakeReranker;

#[async_trait]
impl Reranker for FakeReranker {
    async fn rerank(
        &self,
        _query: &str,
        items: &[RetrievedItem],
        top_n: usize,
    ) -> Result<Vec<RetrievedItem>, CollaboratorError> {
        Ok(items.iter().take(top_n).cloned().collect())
    }
}

pub struct FixedDecider {
    pub needs_tool: bool,
    pub confidence: f64,
}

#[async_trait]
impl DecisionProvider for FixedDecider {
    async fn decide(&self, _query: &str, _context: &[RetrievedItem]) -> Result<Decision, CollaboratorError> {
        Ok(Decision {
            needs_tool: self.needs_tool,
            rationale: "fixed".to_string(),
            confidence: self.confidence,
            source: DecisionSource::Primary,
        })
    }
}

pub struct FakeTool;

#[async_trait]
impl ToolBackend for FakeTool {
    async fn execute(&self, _request: &ToolRequest) -> Result<ToolResult, CollaboratorError> {
        Ok(ToolResult {
            statement: Some("SELECT region, orders FROM sales".to_string()),
            columns: vec!["region".to_string(), "orders".to_string()],
            rows: vec![vec![json!("east"), json!(10)], vec![json!("west"), json!(7)]],
        })
    }
}

pub struct FakeAugmenter;

#[async_trait]
impl Augmenter for FakeAugmenter {
    async fn augment(&self, _query: &str, output: &ToolOutput) -> Result<Augmentation, CollaboratorError> {
        Ok(Augmentation {
            kind: "bar_chart".to_string(),
            spec: json!({ "x": output.columns[0], "y": output.columns[1] }),
        })
    }
}

/// Streams a fixed set of tokens, then appends the rendered tool output.
pub struct FakeSynthesizer;

pub const ANSWER_TOKENS: [&str; 3] = ["The ", "answer ", "is ready."];

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest, sink: &TokenSink) -> Result<String, CollaboratorError> {
        let mut answer = String::new();
        for token in ANSWER_TOKENS {
            sink.send(token).await;
            answer.push_str(token);
        }
        if let Some(output) = &request.tool_output {
            answer.push('\n');
            answer.push_str(&output.rendered);
        }
        Ok(answer)
    }
}

pub struct FailingTool;

#[async_trait]
impl ToolBackend for FailingTool {
    async fn execute(&self, _request: &ToolRequest) -> Result<ToolResult, CollaboratorError> {
        Err(CollaboratorError::Failed("relation \"sales\" does not exist".to_string()))
    }
}

pub struct FailingAugmenter;

#[async_trait]
impl Augmenter for FailingAugmenter {
    async fn augment(&self, _query: &str, _output: &ToolOutput) -> Result<Augmentation, CollaboratorError> {
        Err(CollaboratorError::Unavailable("chart service down".to_string()))
    }
}

/// Streams one token, then fails.
pub struct FailingSynthesizer;

#[async_trait]
impl Synthesizer for FailingSynthesizer {
    async fn synthesize(&self, _request: &SynthesisRequest, sink: &TokenSink) -> Result<String, CollaboratorError> {
        sink.send("partial").await;
        Err(CollaboratorError::Failed("model overloaded".to_string()))
    }
}

/// Wraps a `MemoryInterruptStore` and blocks `save_interrupt` until released.
pub struct GatedStore {
    pub inner: Arc<MemoryInterruptStore>,
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl InterruptStore for GatedStore {
    async fn save_interrupt(&self, interrupt: NewInterrupt) -> AppResult<()> {
        self.started.notify_one();
        self.release.notified().await;
        self.inner.save_interrupt(interrupt).await
    }

    async fn load_interrupt(&self, execution_id: &str) -> AppResult<Option<InterruptRecord>> {
        self.inner.load_interrupt(execution_id).await
    }

    async fn complete_resume(
        &self,
        execution_id: &str,
        state: &Value,
        adjustments: &[ParameterAdjustment],
    ) -> AppResult<bool> {
        self.inner.complete_resume(execution_id, state, adjustments).await
    }

    async fn set_status(&self, execution_id: &str, from: InterruptStatus, to: InterruptStatus) -> AppResult<bool> {
        self.inner.set_status(execution_id, from, to).await
    }

    async fn record_adjustments(&self, adjustments: &[ParameterAdjustment]) -> AppResult<()> {
        self.inner.record_adjustments(adjustments).await
    }

    async fn list_adjustments(&self, execution_id: &str) -> AppResult<Vec<ParameterAdjustment>> {
        self.inner.list_adjustments(execution_id).await
    }

    async fn append_history(&self, entry: &HistoryEntry) -> AppResult<()> {
        self.inner.append_history(entry).await
    }

    async fn list_history(&self, execution_id: &str) -> AppResult<Vec<HistoryEntry>> {
        self.inner.list_history(execution_id).await
    }

    async fn list_interrupted(&self) -> AppResult<Vec<InterruptRecord>> {
        self.inner.list_interrupted().await
    }

    async fn purge_cancelled(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        self.inner.purge_cancelled(older_than).await
    }
}

pub fn collaborators(decider: FixedDecider) -> Collaborators {
    Collaborators {
        retriever: Arc::new(FakeRetriever),
        reranker: Arc::new(FakeReranker),
        decider: Arc::new(decider),
        tool_backend: Arc::new(FakeTool),
        augmenter: Arc::new(FakeAugmenter),
        synthesizer: Arc::new(FakeSynthesizer),
    }
}

pub fn tool_collaborators() -> Collaborators {
    collaborators(FixedDecider {
        needs_tool: true,
        confidence: 0.9,
    })
}

pub fn engine_with_policy(
    collaborators: Collaborators,
    store: Arc<dyn InterruptStore>,
    policy: RouterPolicy,
) -> Arc<WorkflowEngine> {
    let registry = Arc::new(ExecutionRegistry::new());
    let broadcaster = Arc::new(EventBroadcaster::new(registry.clone()));
    let hitl = Arc::new(HitlManager::new(store));
    let graph = WorkflowGraph::standard(collaborators, policy);
    Arc::new(WorkflowEngine::new(graph, registry, broadcaster, hitl))
}

pub fn engine_with(collaborators: Collaborators, store: Arc<dyn InterruptStore>) -> Arc<WorkflowEngine> {
    engine_with_policy(collaborators, store, RouterPolicy::default())
}

pub fn engine(collaborators: Collaborators) -> Arc<WorkflowEngine> {
    engine_with(collaborators, Arc::new(MemoryInterruptStore::new()))
}

pub fn submission(query: &str, client_id: &str, options: QueryOptions) -> Submission {
    Submission {
        query: query.to_string(),
        datasource_ref: Some("sales".to_string()),
        client_id: client_id.to_string(),
        options: Some(options),
    }
}

/// Everything currently queued for a subscriber.
pub fn drain(receiver: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

pub fn started_nodes(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::NodeStarted)
        .filter_map(|e| e.node_id.clone())
        .collect()
}
