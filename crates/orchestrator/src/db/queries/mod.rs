//! Database queries for the durable interrupt store.
//!
//! Query functions organized by table.

pub mod adjustment;
pub mod history;
pub mod interrupt;
