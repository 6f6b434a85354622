//! Node library.
//!
//! Each node reads the state, calls its collaborators and returns a
//! [`NodeOutcome`]. Nodes never touch the registry, the stores or the event
//! channel except through the [`NodeContext`] token sink.

pub mod augment;
pub mod retrieve;
pub mod router;
pub mod synthesize;
pub mod tool_execute;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broadcast::{EventBroadcaster, TokenSink};
use crate::engine::state::{NodeName, WorkflowState};
use crate::error::{CollaboratorError, NodeError};
use crate::hitl::SuspensionKind;

pub use augment::{is_augmentable, AugmentNode};
pub use retrieve::RetrieveNode;
pub use router::{FallbackDecider, HeuristicOverride, RouteNode, RouterPolicy, RuleBasedDecider};
pub use synthesize::SynthesizeNode;
pub use tool_execute::ToolExecuteNode;

/// Result of running one node.
#[derive(Debug)]
pub enum NodeOutcome {
    /// The node finished; continue along the graph with this state.
    Continue(WorkflowState),
    /// The node finished but asks for a human before the graph continues.
    Suspend {
        state: WorkflowState,
        kind: SuspensionKind,
        reason: Option<String>,
    },
    Fail(NodeError),
}

impl From<Result<WorkflowState, NodeError>> for NodeOutcome {
    fn from(result: Result<WorkflowState, NodeError>) -> Self {
        match result {
            Ok(state) => NodeOutcome::Continue(state),
            Err(e) => NodeOutcome::Fail(e),
        }
    }
}

/// Per-execution context handed to nodes.
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: String,
    broadcaster: Arc<EventBroadcaster>,
    timeout: Option<Duration>,
}

impl NodeContext {
    pub fn new(execution_id: impl Into<String>, broadcaster: Arc<EventBroadcaster>, timeout: Option<Duration>) -> Self {
        Self {
            execution_id: execution_id.into(),
            broadcaster,
            timeout,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Await a collaborator call under the configured timeout.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, CollaboratorError>
    where
        F: Future<Output = Result<T, CollaboratorError>> + Send,
    {
        with_timeout(self.timeout, fut).await
    }

    pub fn token_sink(&self, node: NodeName) -> TokenSink {
        TokenSink::new(self.broadcaster.clone(), self.execution_id.clone(), node)
    }
}

pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(CollaboratorError::Timeout(limit.as_millis() as u64))),
        None => fut.await,
    }
}

/// A stage of the workflow graph.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> NodeName;

    async fn run(&self, state: &WorkflowState, ctx: &NodeContext) -> NodeOutcome;

    /// State to continue with after a failure, for nodes whose output is
    /// optional. `None` makes the failure fatal.
    fn degrade(&self, _state: &WorkflowState, _error: &NodeError) -> Option<WorkflowState> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_maps_to_collaborator_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, CollaboratorError>(1)
        };
        let result = with_timeout(Some(Duration::from_millis(10)), slow).await;
        assert!(matches!(result, Err(CollaboratorError::Timeout(10))));

        let fast = async { Ok::<_, CollaboratorError>(2) };
        assert_eq!(with_timeout(None, fast).await.unwrap(), 2);
    }
}
