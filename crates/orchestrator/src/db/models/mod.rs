//! Database models for the durable interrupt store.
//!
//! SQLx-compatible row types for the `querygraph` tables.

pub mod adjustment;
pub mod history;
pub mod interrupt;

pub use adjustment::*;
pub use history::*;
pub use interrupt::*;
