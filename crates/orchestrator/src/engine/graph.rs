//! Workflow graph: nodes plus conditional edges.
//!
//! ```text
//! retrieve -> route -+-> tool_execute -+-> augment -> synthesize -> end
//!                    |                 |              ^
//!                    +-----------------+--------------+
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::nodes::{
    is_augmentable, AugmentNode, Node, RetrieveNode, RouteNode, RouterPolicy, SynthesizeNode, ToolExecuteNode,
};
use crate::services::Collaborators;

use super::state::{NodeName, ResumePoint, WorkflowState};

/// Outgoing edge of a node.
#[derive(Clone, Copy)]
pub enum Edge {
    To(NodeName),
    /// Successor computed from the state the node produced.
    Branch(fn(&WorkflowState) -> NodeName),
    End,
}

fn after_route(state: &WorkflowState) -> NodeName {
    if state.decision.as_ref().is_some_and(|d| d.needs_tool) {
        NodeName::ToolExecute
    } else {
        NodeName::Synthesize
    }
}

fn after_tool_execute(state: &WorkflowState) -> NodeName {
    if state.tool_output.as_ref().is_some_and(is_augmentable) {
        NodeName::Augment
    } else {
        NodeName::Synthesize
    }
}

pub struct WorkflowGraph {
    entry: NodeName,
    nodes: HashMap<NodeName, Arc<dyn Node>>,
    edges: HashMap<NodeName, Edge>,
}

impl WorkflowGraph {
    /// An empty graph starting at `entry`.
    pub fn new(entry: NodeName) -> Self {
        Self {
            entry,
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    /// The five-stage query graph.
    pub fn standard(collaborators: Collaborators, policy: RouterPolicy) -> Self {
        Self::new(NodeName::Retrieve)
            .with_node(Arc::new(RetrieveNode::new(collaborators.retriever, collaborators.reranker)))
            .with_node(Arc::new(RouteNode::new(collaborators.decider, policy)))
            .with_node(Arc::new(ToolExecuteNode::new(collaborators.tool_backend)))
            .with_node(Arc::new(AugmentNode::new(collaborators.augmenter)))
            .with_node(Arc::new(SynthesizeNode::new(collaborators.synthesizer)))
            .with_edge(NodeName::Retrieve, Edge::To(NodeName::Route))
            .with_edge(NodeName::Route, Edge::Branch(after_route))
            .with_edge(NodeName::ToolExecute, Edge::Branch(after_tool_execute))
            .with_edge(NodeName::Augment, Edge::To(NodeName::Synthesize))
            .with_edge(NodeName::Synthesize, Edge::End)
    }

    pub fn with_node(mut self, node: Arc<dyn Node>) -> Self {
        self.nodes.insert(node.name(), node);
        self
    }

    pub fn with_edge(mut self, from: NodeName, edge: Edge) -> Self {
        self.edges.insert(from, edge);
        self
    }

    pub fn entry(&self) -> NodeName {
        self.entry
    }

    pub fn node(&self, name: NodeName) -> Option<&Arc<dyn Node>> {
        self.nodes.get(&name)
    }

    /// Successor of `from` given the state it produced. Missing edges end the run.
    pub fn next(&self, from: NodeName, state: &WorkflowState) -> Option<NodeName> {
        match self.edges.get(&from).copied().unwrap_or(Edge::End) {
            Edge::To(node) => Some(node),
            Edge::Branch(choose) => Some(choose(state)),
            Edge::End => None,
        }
    }

    /// First node to run when resuming at `point`.
    pub fn resolve(&self, point: ResumePoint, state: &WorkflowState) -> Option<NodeName> {
        match point {
            ResumePoint::At(node) => Some(node),
            ResumePoint::After(node) => self.next(node, state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{Decision, DecisionSource, OutputFormat, QueryOptions, ToolOutput};
    use serde_json::json;

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new(NodeName::Retrieve)
            .with_edge(NodeName::Retrieve, Edge::To(NodeName::Route))
            .with_edge(NodeName::Route, Edge::Branch(after_route))
            .with_edge(NodeName::ToolExecute, Edge::Branch(after_tool_execute))
            .with_edge(NodeName::Synthesize, Edge::End)
    }

    fn decided(needs_tool: bool) -> WorkflowState {
        let mut state = WorkflowState::new("q", None, QueryOptions::default());
        state
            .set_decision(Decision {
                needs_tool,
                rationale: String::new(),
                confidence: 0.9,
                source: DecisionSource::Primary,
            })
            .unwrap();
        state
    }

    #[test]
    fn test_route_branch() {
        let graph = graph();
        assert_eq!(graph.next(NodeName::Route, &decided(true)), Some(NodeName::ToolExecute));
        assert_eq!(graph.next(NodeName::Route, &decided(false)), Some(NodeName::Synthesize));
        assert_eq!(graph.next(NodeName::Synthesize, &decided(false)), None);
    }

    #[test]
    fn test_tool_branch_depends_on_augmentability() {
        let graph = graph();
        let mut state = decided(true);
        state
            .set_tool_output(ToolOutput {
                statement: None,
                columns: vec!["region".to_string(), "total".to_string()],
                rows: vec![vec![json!("n"), json!(1)], vec![json!("s"), json!(2)]],
                format: OutputFormat::Table,
                rendered: String::new(),
            })
            .unwrap();
        assert_eq!(graph.next(NodeName::ToolExecute, &state), Some(NodeName::Augment));
        assert_eq!(graph.next(NodeName::ToolExecute, &decided(true)), Some(NodeName::Synthesize));
    }

    #[test]
    fn test_resolve_resume_point() {
        let graph = graph();
        let state = decided(false);
        assert_eq!(
            graph.resolve(ResumePoint::At(NodeName::Route), &state),
            Some(NodeName::Route)
        );
        assert_eq!(
            graph.resolve(ResumePoint::After(NodeName::Route), &state),
            Some(NodeName::Synthesize)
        );
    }
}
