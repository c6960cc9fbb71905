//! Scheduler state and its observable snapshot

use chrono::{DateTime, Utc};
use hive_task::TaskId;
use serde::{Deserialize, Serialize};

/// Mode of the scheduler loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SchedulerState {
    #[default]
    Running,
    /// Global hard freeze: runners paused, nothing new starts
    Frozen {
        since: DateTime<Utc>,
        reason: Option<String>,
    },
    /// Rest advisory sent; work continues until each runner checkpoints
    Resting { since: DateTime<Utc> },
}

impl SchedulerState {
    pub fn is_frozen(&self) -> bool {
        matches!(self, SchedulerState::Frozen { .. })
    }

    pub fn is_resting(&self) -> bool {
        matches!(self, SchedulerState::Resting { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Running => "running",
            SchedulerState::Frozen { .. } => "frozen",
            SchedulerState::Resting { .. } => "resting",
        }
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alignment session with one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentSession {
    pub task_id: TaskId,
    pub question: String,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time view published after every tick and state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub state: SchedulerState,
    pub active_runners: Vec<TaskId>,
    pub frozen_tasks: Vec<TaskId>,
    pub alignment: Option<AlignmentSession>,
    pub ticks: u64,
    pub skipped_ticks: u64,
}
