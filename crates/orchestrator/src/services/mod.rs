//! External collaborator boundary.
//!
//! Nodes only see these traits. The algorithms behind them (vector search,
//! reranking models, statement generation, answer generation) live outside
//! this service; [`HttpBackend`] is the default implementation.

mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broadcast::TokenSink;
use crate::engine::state::{Augmentation, Decision, RetrievedItem, ToolOutput};
use crate::error::CollaboratorError;

pub use http::HttpBackend;

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        datasource_ref: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<RetrievedItem>, CollaboratorError>;
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        items: &[RetrievedItem],
        top_n: usize,
    ) -> Result<Vec<RetrievedItem>, CollaboratorError>;
}

/// Decides whether a query needs the tool-execution stage.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, query: &str, context: &[RetrievedItem]) -> Result<Decision, CollaboratorError>;
}

/// Input to the tool backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub query: String,
    pub datasource_ref: Option<String>,
    pub rationale: String,
    pub context: Vec<RetrievedItem>,
}

/// Raw tabular result of a tool run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub statement: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Generates and runs a statement against a datasource.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn execute(&self, request: &ToolRequest) -> Result<ToolResult, CollaboratorError>;
}

#[async_trait]
pub trait Augmenter: Send + Sync {
    async fn augment(&self, query: &str, output: &ToolOutput) -> Result<Augmentation, CollaboratorError>;
}

/// Input to answer generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub query: String,
    pub context: Vec<RetrievedItem>,
    pub tool_output: Option<ToolOutput>,
    pub augmentation: Option<Augmentation>,
}

/// Streams the answer into `sink` token by token and returns the full text.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest, sink: &TokenSink) -> Result<String, CollaboratorError>;
}

/// The collaborators a workflow graph is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub retriever: Arc<dyn Retriever>,
    pub reranker: Arc<dyn Reranker>,
    pub decider: Arc<dyn DecisionProvider>,
    pub tool_backend: Arc<dyn ToolBackend>,
    pub augmenter: Arc<dyn Augmenter>,
    pub synthesizer: Arc<dyn Synthesizer>,
}
