//! Task state machine
//!
//! ```text
//! pending ──► needs-approval ──► running ──► completed
//!    │              │               │    └──► failed
//!    │              │               │
//!    └──────────────┴───────────────┴──► cancelled
//! ```
//!
//! `pending`/`needs-approval` may also go straight to `failed` when the
//! container cannot be acquired. Terminal states have no way out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Possible states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Submitted, not yet started
    Pending,

    /// Waiting on a human decision
    NeedsApproval,

    /// Executing inside its container
    Running,

    /// Finished successfully
    Completed,

    /// Finished with an error
    Failed,

    /// Cancelled before finishing
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::NeedsApproval,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, NeedsApproval)
                | (Pending, Running)
                | (Pending, Failed)
                | (NeedsApproval, Running)
                | (NeedsApproval, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Pending | NeedsApproval | Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::NeedsApproval => "needs-approval",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
