//! Configuration module for the QueryGraph orchestrator.
//!
//! This module provides configuration loading from environment variables
//! using the `envy` crate for type-safe environment variable parsing.

mod app;
mod database;

pub use app::{AppConfig, InterruptStoreKind};
pub use database::DatabaseConfig;
