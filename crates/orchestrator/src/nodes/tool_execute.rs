//! Tool-execution stage.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::state::{NodeName, ToolOutput, WorkflowState};
use crate::error::NodeError;
use crate::services::{ToolBackend, ToolRequest};

use super::{Node, NodeContext, NodeOutcome};

pub struct ToolExecuteNode {
    backend: Arc<dyn ToolBackend>,
}

impl ToolExecuteNode {
    pub fn new(backend: Arc<dyn ToolBackend>) -> Self {
        Self { backend }
    }

    async fn execute(&self, state: &WorkflowState, ctx: &NodeContext) -> Result<WorkflowState, NodeError> {
        let decision = state.decision.as_ref().ok_or(NodeError::MissingInput("decision"))?;
        let request = ToolRequest {
            query: state.query.clone(),
            datasource_ref: state.datasource_ref.clone(),
            rationale: decision.rationale.clone(),
            context: state.context_items().to_vec(),
        };

        let result = ctx.call(self.backend.execute(&request)).await?;
        // Rendered with the current options, which a resume may have overridden.
        let format = state.options.output_format;
        let rendered = format.render(&result.columns, &result.rows);
        tracing::debug!(
            execution_id = %ctx.execution_id,
            rows = result.rows.len(),
            format = ?format,
            "Tool execution returned rows"
        );

        let mut next = state.clone();
        next.set_tool_output(ToolOutput {
            statement: result.statement,
            columns: result.columns,
            rows: result.rows,
            format,
            rendered,
        })?;
        Ok(next)
    }
}

#[async_trait]
impl Node for ToolExecuteNode {
    fn name(&self) -> NodeName {
        NodeName::ToolExecute
    }

    async fn run(&self, state: &WorkflowState, ctx: &NodeContext) -> NodeOutcome {
        self.execute(state, ctx).await.into()
    }
}
