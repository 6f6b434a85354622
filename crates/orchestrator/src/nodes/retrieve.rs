//! Retrieval stage: retrieve, then rerank.
//!
//! A reranker failure is not fatal: the retrieved items are ordered by
//! score and truncated to `rerank_top_n` instead, with a note in the
//! state extensions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::state::{NodeName, RetrievedItem, WorkflowState};
use crate::error::NodeError;
use crate::services::{Reranker, Retriever};

use super::{Node, NodeContext, NodeOutcome};

pub struct RetrieveNode {
    retriever: Arc<dyn Retriever>,
    reranker: Arc<dyn Reranker>,
}

impl RetrieveNode {
    pub fn new(retriever: Arc<dyn Retriever>, reranker: Arc<dyn Reranker>) -> Self {
        Self { retriever, reranker }
    }

    async fn execute(&self, state: &WorkflowState, ctx: &NodeContext) -> Result<WorkflowState, NodeError> {
        let options = &state.options;
        let items = ctx
            .call(
                self.retriever
                    .retrieve(&state.query, state.datasource_ref.as_deref(), options.retrieval_top_k),
            )
            .await?;

        let mut next = state.clone();
        next.set_retrieved(items.clone())?;

        match ctx
            .call(self.reranker.rerank(&state.query, &items, options.rerank_top_n))
            .await
        {
            Ok(mut reranked) => {
                reranked.truncate(options.rerank_top_n);
                next.set_reranked(reranked)?;
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = %ctx.execution_id,
                    error = %e,
                    "Reranker failed, falling back to retrieval scores"
                );
                next.set_reranked(top_by_score(&items, options.rerank_top_n))?;
                next.extend("rerank_fallback", json!({ "error": e.to_string() }))?;
            }
        }

        Ok(next)
    }
}

fn top_by_score(items: &[RetrievedItem], top_n: usize) -> Vec<RetrievedItem> {
    let mut sorted = items.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));
    sorted.truncate(top_n);
    sorted
}

#[async_trait]
impl Node for RetrieveNode {
    fn name(&self) -> NodeName {
        NodeName::Retrieve
    }

    async fn run(&self, state: &WorkflowState, ctx: &NodeContext) -> NodeOutcome {
        self.execute(state, ctx).await.into()
    }
}
