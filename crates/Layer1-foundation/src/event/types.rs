//! Event Types - notifications emitted by the control plane
//!
//! Each event is a short human-readable string tagged with the task it
//! concerns (or none, for global events).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Event Kind
// ============================================================================

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Enqueued,
    Assigned,
    Started,
    Resumed,
    Paused,
    Progress,
    Question,
    Completed,
    Failed,
    Revised,
    AlignmentStarted,
    AlignmentEnded,
    Frozen,
    Unfrozen,
    Resting,
    CronFired,
    CronFailed,
    System,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Assigned => "assigned",
            Self::Started => "started",
            Self::Resumed => "resumed",
            Self::Paused => "paused",
            Self::Progress => "progress",
            Self::Question => "question",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Revised => "revised",
            Self::AlignmentStarted => "alignment_started",
            Self::AlignmentEnded => "alignment_ended",
            Self::Frozen => "frozen",
            Self::Unfrozen => "unfrozen",
            Self::Resting => "resting",
            Self::CronFired => "cron_fired",
            Self::CronFailed => "cron_failed",
            Self::System => "system",
        }
    }

    /// Events a human should see promptly
    pub fn is_attention(&self) -> bool {
        matches!(
            self,
            Self::Question | Self::Failed | Self::AlignmentStarted | Self::CronFailed
        )
    }
}

// ============================================================================
// Task Event
// ============================================================================

/// Notification emitted for a state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// Task the event concerns (`None` = global)
    pub task_id: Option<String>,

    pub kind: EventKind,

    /// Human-readable text
    pub message: String,

    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn task(task_id: impl Into<String>, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn global(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.task_id {
            Some(id) => write!(f, "[{}] {}", id, self.message),
            None => write!(f, "[global] {}", self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_tagged() {
        let event = TaskEvent::task("t-1", EventKind::Started, "started in sandbox");
        assert_eq!(event.to_string(), "[t-1] started in sandbox");

        let global = TaskEvent::global(EventKind::Frozen, "all work frozen");
        assert_eq!(global.to_string(), "[global] all work frozen");
    }
}
