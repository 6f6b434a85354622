//! HTTP and WebSocket handlers.

pub mod executions;
pub mod health;
pub mod query;
pub mod ws;

pub use health::{api_health, health_check};
pub use query::submit_query;
pub use ws::ws_handler;
