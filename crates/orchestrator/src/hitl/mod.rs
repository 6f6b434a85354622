//! Human-in-the-loop suspension.
//!
//! Two suspension kinds share one manager:
//! - **pause**: the state is kept in an in-process table and lost on restart.
//! - **interrupt**: the state is written to the durable [`InterruptStore`]
//!   and can be resumed by a different process.

mod manager;
mod pause;
mod store;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use manager::{CleanupReport, HitlManager, ResumeOutcome, Resumed};
pub use pause::{PauseRecord, PauseTable};
pub use store::{InterruptStore, MemoryInterruptStore, PgInterruptStore};

/// How an execution is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    Pause,
    Interrupt,
}

impl std::fmt::Display for SuspensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause => write!(f, "pause"),
            Self::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Age limits applied by [`HitlManager::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Pause records older than this are dropped.
    pub pause_max_age: Duration,
    /// Cancelled interrupt records older than this are deleted.
    pub interrupt_retention: Duration,
}

impl RetentionPolicy {
    /// Same limit for both record kinds.
    pub fn uniform(max_age: Duration) -> Self {
        Self {
            pause_max_age: max_age,
            interrupt_retention: max_age,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            pause_max_age: Duration::from_secs(3600),
            interrupt_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}
