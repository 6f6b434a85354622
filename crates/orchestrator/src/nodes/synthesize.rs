//! Synthesis stage. Streams the answer token by token.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::state::{NodeName, WorkflowState};
use crate::error::NodeError;
use crate::services::{SynthesisRequest, Synthesizer};

use super::{Node, NodeContext, NodeOutcome};

pub struct SynthesizeNode {
    synthesizer: Arc<dyn Synthesizer>,
}

impl SynthesizeNode {
    pub fn new(synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self { synthesizer }
    }

    async fn execute(&self, state: &WorkflowState, ctx: &NodeContext) -> Result<WorkflowState, NodeError> {
        let request = SynthesisRequest {
            query: state.query.clone(),
            context: state.context_items().to_vec(),
            tool_output: state.tool_output.clone(),
            augmentation: state.augmentation.clone().filter(|a| !a.is_empty()),
        };

        let sink = ctx.token_sink(NodeName::Synthesize);
        let answer = ctx.call(self.synthesizer.synthesize(&request, &sink)).await;
        sink.finish().await;
        let answer = answer?;

        let mut next = state.clone();
        next.set_answer(answer)?;
        Ok(next)
    }
}

#[async_trait]
impl Node for SynthesizeNode {
    fn name(&self) -> NodeName {
        NodeName::Synthesize
    }

    async fn run(&self, state: &WorkflowState, ctx: &NodeContext) -> NodeOutcome {
        self.execute(state, ctx).await.into()
    }
}
