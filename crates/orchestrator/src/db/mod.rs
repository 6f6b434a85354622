//! Database module for the durable interrupt store.
//!
//! Connectivity, schema bootstrap, models and queries for PostgreSQL
//! using SQLx.

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::{create_pool, DbPool};
pub use schema::init_schema;
