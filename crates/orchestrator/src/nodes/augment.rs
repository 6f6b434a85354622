//! Augmentation stage (e.g. chart specifications for numeric results).
//!
//! Degradable: a failing augmenter leaves an empty augmentation and the
//! workflow continues to synthesis.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::state::{Augmentation, NodeName, ToolOutput, WorkflowState};
use crate::error::NodeError;
use crate::services::Augmenter;

use super::{Node, NodeContext, NodeOutcome};

/// At least two rows, two columns and one fully numeric column.
pub fn is_augmentable(output: &ToolOutput) -> bool {
    if output.rows.len() < 2 || output.columns.len() < 2 {
        return false;
    }
    (0..output.columns.len()).any(|col| {
        output
            .rows
            .iter()
            .all(|row| row.get(col).is_some_and(is_numeric))
    })
}

fn is_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

pub struct AugmentNode {
    augmenter: Arc<dyn Augmenter>,
}

impl AugmentNode {
    pub fn new(augmenter: Arc<dyn Augmenter>) -> Self {
        Self { augmenter }
    }

    async fn execute(&self, state: &WorkflowState, ctx: &NodeContext) -> Result<WorkflowState, NodeError> {
        let output = state
            .tool_output
            .as_ref()
            .ok_or(NodeError::MissingInput("tool_output"))?;
        let augmentation = ctx.call(self.augmenter.augment(&state.query, output)).await?;

        let mut next = state.clone();
        next.set_augmentation(augmentation)?;
        Ok(next)
    }
}

#[async_trait]
impl Node for AugmentNode {
    fn name(&self) -> NodeName {
        NodeName::Augment
    }

    async fn run(&self, state: &WorkflowState, ctx: &NodeContext) -> NodeOutcome {
        self.execute(state, ctx).await.into()
    }

    fn degrade(&self, state: &WorkflowState, error: &NodeError) -> Option<WorkflowState> {
        let mut next = state.clone();
        next.set_augmentation(Augmentation::empty()).ok()?;
        next.extend("augmentation_error", json!(error.to_string())).ok()?;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{OutputFormat, QueryOptions};
    use crate::error::CollaboratorError;

    fn output(columns: &[&str], rows: Vec<Vec<Value>>) -> ToolOutput {
        ToolOutput {
            statement: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            format: OutputFormat::Table,
            rendered: String::new(),
        }
    }

    #[test]
    fn test_is_augmentable() {
        let numeric = output(
            &["region", "total"],
            vec![vec![json!("north"), json!(10)], vec![json!("south"), json!("12.5")]],
        );
        assert!(is_augmentable(&numeric));

        let single_row = output(&["region", "total"], vec![vec![json!("north"), json!(10)]]);
        assert!(!is_augmentable(&single_row));

        let text_only = output(
            &["name", "city"],
            vec![vec![json!("a"), json!("x")], vec![json!("b"), json!("y")]],
        );
        assert!(!is_augmentable(&text_only));

        let one_column = output(&["total"], vec![vec![json!(1)], vec![json!(2)]]);
        assert!(!is_augmentable(&one_column));
    }

    struct NoAugmenter;

    #[async_trait]
    impl Augmenter for NoAugmenter {
        async fn augment(&self, _query: &str, _output: &ToolOutput) -> Result<Augmentation, CollaboratorError> {
            Err(CollaboratorError::Failed("no chart".to_string()))
        }
    }

    #[test]
    fn test_degrade_yields_empty_augmentation() {
        let node = AugmentNode::new(Arc::new(NoAugmenter));
        let state = WorkflowState::new("q", None, QueryOptions::default());
        let error = NodeError::from(CollaboratorError::Failed("no chart".to_string()));

        let degraded = node.degrade(&state, &error).unwrap();
        assert!(degraded.augmentation.unwrap().is_empty());
        assert!(degraded.extensions.contains_key("augmentation_error"));
    }
}
