//! Workflow engine, graph, state and the execution state store.

pub mod graph;
pub mod state;
pub mod store;
pub mod workflow;

pub use graph::{Edge, WorkflowGraph};
pub use state::{ExecutionStatus, NodeName, QueryOptions, WorkflowState};
pub use store::{ExecutionSnapshot, ExecutionStateStore};
pub use workflow::{CancelOutcome, EngineCleanup, ExecutionResult, PreparedResume, Submission, WorkflowEngine};
