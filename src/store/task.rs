//! Processing task row types and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::item::Stage;

/// Status of a durable scheduler task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on the scheduler heap.
    Queued,
    /// Currently executing in a worker.
    Active,
    /// Handler reported success.
    Completed,
    /// Handler failed and no retry remains.
    Failed,
    /// Dropped without running (e.g. superseded by a newer task).
    Skipped,
    /// Removed before or at dispatch (state mismatch, shutdown, pause).
    Cancelled,
}

impl TaskStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` once a task can no longer run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// A durable row backing one scheduler entry for an (item, stage) pair.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    /// Unique identifier.
    pub id: i64,
    /// Item this task processes.
    pub item_id: i64,
    /// Stage name (stored as text, parsed via `stage()`).
    #[sqlx(rename = "stage")]
    pub stage_str: String,
    /// Current task status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Higher priority tasks dispatch first at equal run times.
    pub priority: i64,
    /// Number of retry attempts made.
    pub retry_count: i64,
    /// Retry budget for this task.
    pub max_retries: i64,
    /// Last error message if the task failed or was requeued.
    pub error_message: Option<String>,
    /// Classified error kind for the last failure.
    pub error_kind: Option<String>,
    /// Freeform JSON blob attached at schedule time.
    pub task_data: Option<String>,
    /// Earliest time the task may run again.
    pub next_retry_at: Option<String>,
    /// When the task last became active.
    pub started_at: Option<String>,
    /// When the task reached a terminal status.
    pub completed_at: Option<String>,
    /// When the task was created.
    pub created_at: String,
    /// When the task was last updated.
    pub updated_at: String,
}

impl TaskRow {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Queued` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status_str.parse().unwrap_or(TaskStatus::Queued)
    }

    /// Returns the parsed stage, if the stored name is recognized.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        self.stage_str.parse().ok()
    }
}

impl fmt::Display for TaskRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task {{ id: {}, item: {}, stage: {}, status: {} }}",
            self.id,
            self.item_id,
            self.stage_str,
            self.status()
        )
    }
}
