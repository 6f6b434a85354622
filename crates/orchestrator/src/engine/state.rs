//! Workflow state carried through the node graph.
//!
//! Every stage owns one set-once slot. Nodes fill their slot and append
//! per-node diagnostics; they never rewrite a slot filled upstream. The only
//! path that changes a populated field is a human override applied at resume
//! time, which is audited by the HITL manager.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateError;

/// Current layout version of [`WorkflowState`].
pub const STATE_VERSION: u32 = 1;

/// Fields an override may not touch.
const PROTECTED_FIELDS: &[&str] = &["version", "hitl", "node_status"];

/// Stages of the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeName {
    Retrieve,
    Route,
    ToolExecute,
    Augment,
    Synthesize,
}

impl NodeName {
    pub const ALL: [NodeName; 5] = [
        NodeName::Retrieve,
        NodeName::Route,
        NodeName::ToolExecute,
        NodeName::Augment,
        NodeName::Synthesize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieve => "retrieve",
            Self::Route => "route",
            Self::ToolExecute => "tool_execute",
            Self::Augment => "augment",
            Self::Synthesize => "synthesize",
        }
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeName {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeName::ALL
            .into_iter()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| StateError::UnknownField(format!("node '{}'", s)))
    }
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Interrupted,
    Completed,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    /// Completed, errored or cancelled executions never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single item returned by the retrieval stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub id: String,
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
}

/// Rendering applied to tool-execution rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Markdown table.
    #[default]
    Table,
    Csv,
    Json,
}

impl OutputFormat {
    /// Render tabular tool output in this format.
    pub fn render(&self, columns: &[String], rows: &[Vec<Value>]) -> String {
        match self {
            Self::Table => {
                let mut out = format!("| {} |\n", columns.join(" | "));
                out.push_str(&format!(
                    "|{}\n",
                    columns.iter().map(|_| "---|").collect::<String>()
                ));
                for row in rows {
                    let cells: Vec<String> = row.iter().map(cell_text).collect();
                    out.push_str(&format!("| {} |\n", cells.join(" | ")));
                }
                out
            }
            Self::Csv => {
                let mut out = columns.join(",");
                out.push('\n');
                for row in rows {
                    let cells: Vec<String> = row.iter().map(cell_text).collect();
                    out.push_str(&cells.join(","));
                    out.push('\n');
                }
                out
            }
            Self::Json => {
                let records: Vec<Value> = rows
                    .iter()
                    .map(|row| {
                        let obj: serde_json::Map<String, Value> = columns
                            .iter()
                            .cloned()
                            .zip(row.iter().cloned())
                            .collect();
                        Value::Object(obj)
                    })
                    .collect();
                Value::Array(records).to_string()
            }
        }
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Run parameters that can be overridden when a suspended execution resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub retrieval_top_k: usize,
    pub rerank_top_n: usize,
    pub output_format: OutputFormat,
    /// Pause (in memory) before entering these nodes.
    pub pause_before: Vec<NodeName>,
    /// Interrupt (durably) before entering these nodes.
    pub interrupt_before: Vec<NodeName>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            retrieval_top_k: 20,
            rerank_top_n: 5,
            output_format: OutputFormat::Table,
            pause_before: Vec::new(),
            interrupt_before: Vec::new(),
        }
    }
}

/// Where a router decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Primary,
    Fallback,
    HeuristicOverride,
}

/// Router output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub needs_tool: bool,
    pub rationale: String,
    pub confidence: f64,
    pub source: DecisionSource,
}

/// Tool-execution output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Statement the backend generated and ran, if any.
    #[serde(default)]
    pub statement: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub format: OutputFormat,
    /// `rows` rendered in `format`.
    pub rendered: String,
}

/// Augmentation output (e.g. a chart specification).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Augmentation {
    pub kind: String,
    #[serde(default)]
    pub spec: Value,
}

impl Augmentation {
    /// Placeholder produced when augmentation degrades.
    pub fn empty() -> Self {
        Self {
            kind: "none".to_string(),
            spec: Value::Null,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == "none"
    }
}

/// Outcome of a node as recorded in the diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Suspended,
    Degraded,
    Failed,
}

/// Per-node diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDiagnostic {
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// HITL status stored on the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlStatus {
    Paused,
    Interrupted,
    Resumed,
    Cancelled,
}

/// Node at which a resumed execution re-enters the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "node", rename_all = "snake_case")]
pub enum ResumePoint {
    /// Re-enter at this node; it has not run yet.
    At(NodeName),
    /// This node already ran; continue with its successor.
    After(NodeName),
}

/// HITL metadata attached to a suspended (or resumed) state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlMetadata {
    pub status: HitlStatus,
    pub node: NodeName,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub resume: ResumePoint,
}

/// Complete state of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub version: u32,
    pub query: String,
    #[serde(default)]
    pub datasource_ref: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
    #[serde(default)]
    pub retrieved: Option<Vec<RetrievedItem>>,
    #[serde(default)]
    pub reranked: Option<Vec<RetrievedItem>>,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub tool_output: Option<ToolOutput>,
    #[serde(default)]
    pub augmentation: Option<Augmentation>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub node_status: BTreeMap<String, NodeDiagnostic>,
    /// Free-form diagnostics; keys are set once like the stage slots.
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
    #[serde(default)]
    pub hitl: Option<HitlMetadata>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: &'static str) -> Result<(), StateError> {
    if slot.is_some() {
        return Err(StateError::AlreadySet(field));
    }
    *slot = Some(value);
    Ok(())
}

impl WorkflowState {
    pub fn new(query: impl Into<String>, datasource_ref: Option<String>, options: QueryOptions) -> Self {
        Self {
            version: STATE_VERSION,
            query: query.into(),
            datasource_ref,
            options,
            retrieved: None,
            reranked: None,
            decision: None,
            tool_output: None,
            augmentation: None,
            answer: None,
            node_status: BTreeMap::new(),
            extensions: BTreeMap::new(),
            hitl: None,
        }
    }

    pub fn set_retrieved(&mut self, items: Vec<RetrievedItem>) -> Result<(), StateError> {
        set_once(&mut self.retrieved, items, "retrieved")
    }

    pub fn set_reranked(&mut self, items: Vec<RetrievedItem>) -> Result<(), StateError> {
        set_once(&mut self.reranked, items, "reranked")
    }

    pub fn set_decision(&mut self, decision: Decision) -> Result<(), StateError> {
        set_once(&mut self.decision, decision, "decision")
    }

    pub fn set_tool_output(&mut self, output: ToolOutput) -> Result<(), StateError> {
        set_once(&mut self.tool_output, output, "tool_output")
    }

    pub fn set_augmentation(&mut self, augmentation: Augmentation) -> Result<(), StateError> {
        set_once(&mut self.augmentation, augmentation, "augmentation")
    }

    pub fn set_answer(&mut self, answer: String) -> Result<(), StateError> {
        set_once(&mut self.answer, answer, "answer")
    }

    /// Add a diagnostic extension. Existing keys are never replaced.
    pub fn extend(&mut self, key: impl Into<String>, value: Value) -> Result<(), StateError> {
        let key = key.into();
        if self.extensions.contains_key(&key) {
            return Err(StateError::ExtensionExists(key));
        }
        self.extensions.insert(key, value);
        Ok(())
    }

    /// Record a node diagnostic. A second record for the same node is kept
    /// as a note on the first.
    pub fn record_node(&mut self, node: NodeName, diagnostic: NodeDiagnostic) {
        self.node_status
            .entry(node.to_string())
            .and_modify(|existing| {
                existing.notes.push(format!(
                    "{:?} after {}ms{}",
                    diagnostic.status,
                    diagnostic.duration_ms,
                    diagnostic
                        .error
                        .as_deref()
                        .map(|e| format!(": {}", e))
                        .unwrap_or_default()
                ));
            })
            .or_insert(diagnostic);
    }

    /// The retrieval subset downstream stages should use.
    pub fn context_items(&self) -> &[RetrievedItem] {
        self.reranked
            .as_deref()
            .or(self.retrieved.as_deref())
            .unwrap_or(&[])
    }

    /// Compact summary of a stage's output, attached to `node_completed` events.
    pub fn stage_output(&self, node: NodeName) -> Option<Value> {
        match node {
            NodeName::Retrieve => Some(serde_json::json!({
                "retrieved": self.retrieved.as_ref().map(Vec::len).unwrap_or(0),
                "reranked": self.reranked.as_ref().map(Vec::len).unwrap_or(0),
            })),
            NodeName::Route => self.decision.as_ref().and_then(|d| serde_json::to_value(d).ok()),
            NodeName::ToolExecute => self.tool_output.as_ref().map(|t| {
                serde_json::json!({
                    "statement": t.statement,
                    "row_count": t.rows.len(),
                    "format": t.format,
                })
            }),
            NodeName::Augment => self
                .augmentation
                .as_ref()
                .and_then(|a| serde_json::to_value(a).ok()),
            NodeName::Synthesize => self
                .answer
                .as_ref()
                .map(|a| serde_json::json!({ "answer_chars": a.chars().count() })),
        }
    }

    /// Restore a state from a serialized snapshot, checking its version.
    pub fn from_snapshot(value: Value) -> Result<Self, StateError> {
        let raw = value
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(STATE_VERSION));
        let unsupported = |found: u32| StateError::UnsupportedVersion {
            found,
            supported: STATE_VERSION,
        };
        let found = u32::try_from(raw).map_err(|_| unsupported(u32::MAX))?;
        if found > STATE_VERSION {
            return Err(unsupported(found));
        }
        serde_json::from_value(value).map_err(|e| StateError::Serialization(e.to_string()))
    }

    pub fn to_snapshot(&self) -> Result<Value, StateError> {
        serde_json::to_value(self).map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Replace the field named by a dotted path (e.g. `options.output_format`)
    /// and return its previous value.
    pub fn apply_override(&mut self, path: &str, value: Value) -> Result<Value, StateError> {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(StateError::UnknownField(path.to_string()));
        };
        if PROTECTED_FIELDS.contains(&segments[0]) {
            return Err(StateError::ProtectedField(path.to_string()));
        }

        let mut root = self.to_snapshot()?;
        let mut cursor = &mut root;
        for segment in parents {
            cursor = cursor
                .get_mut(*segment)
                .filter(|v| v.is_object())
                .ok_or_else(|| StateError::UnknownField(path.to_string()))?;
        }
        let object = cursor
            .as_object_mut()
            .ok_or_else(|| StateError::UnknownField(path.to_string()))?;
        let slot = object
            .get_mut(*last)
            .ok_or_else(|| StateError::UnknownField(path.to_string()))?;
        let old = std::mem::replace(slot, value);

        *self = serde_json::from_value(root).map_err(|e| StateError::Serialization(e.to_string()))?;
        Ok(old)
    }
}
