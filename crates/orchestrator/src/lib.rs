//! QueryGraph Orchestrator
//!
//! A query-workflow orchestration service. Each user query runs through a
//! fixed graph of stages:
//!
//! - **Retrieve**: fetch and rerank context for the query
//! - **Route**: decide whether the query needs the tool stage
//! - **Tool execute**: run a generated statement against a datasource
//! - **Augment**: optional chart or similar enrichment of tabular results
//! - **Synthesize**: stream the final answer token by token
//!
//! ## Architecture
//!
//! The [`engine`] drives executions node by node and checks the
//! [`registry`] for cancellation and suspension requests at every node
//! boundary. Suspended executions are held by the [`hitl`] manager, either
//! in memory (pause) or in PostgreSQL (interrupt, survives restarts).
//! Lifecycle and token events reach exactly one subscriber per execution
//! through the [`broadcast`] module.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: Interrupt store schema, models and queries
//! - [`error`]: Error types with Axum integration
//! - [`handlers`]: HTTP and WebSocket handlers
//! - [`nodes`]: The workflow stages
//! - [`services`]: External collaborator traits and the HTTP backend
//! - [`state`]: Shared application state

pub mod broadcast;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod hitl;
pub mod nodes;
pub mod registry;
pub mod result_ext;
pub mod services;
pub mod state;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
