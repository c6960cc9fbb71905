//! Task state machine

use serde::{Deserialize, Serialize};

/// Possible states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Waiting for an executor to be chosen
    Pending,

    /// Executor chosen, waiting for a runner
    Assigned,

    /// A runner is driving the task
    #[serde(alias = "in_progress")]
    InProgress,

    /// Execution frozen in place
    Paused,

    /// Task completed successfully
    Completed,

    /// Task failed
    Failed,
}

impl TaskStatus {
    /// Check if this is a terminal state (only a revision leaves it)
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Check if task is being executed (running or frozen)
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Paused)
    }

    /// Forward transitions allowed through `update_status`.
    ///
    /// Terminal -> assigned is deliberately absent: only a revision may do that.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Failed)
                | (Assigned, InProgress)
                | (Assigned, Failed)
                | (InProgress, Paused)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Paused, InProgress)
                | (Paused, Failed)
        )
    }

    /// Get display name for the state
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Get a symbol for the state
    pub fn symbol(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "◯",
            TaskStatus::Assigned => "◎",
            TaskStatus::InProgress => "⟳",
            TaskStatus::Paused => "⏸",
            TaskStatus::Completed => "✓",
            TaskStatus::Failed => "✗",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = hive_foundation::Error;

    fn from_str(s: &str) -> hive_foundation::Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "in-progress" | "in_progress" => Ok(TaskStatus::InProgress),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(hive_foundation::Error::InvalidInput(format!(
                "unknown task status: {}",
                other
            ))),
        }
    }
}
