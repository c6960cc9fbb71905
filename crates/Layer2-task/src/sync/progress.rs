//! Progress snapshot written by the execution environment

use hive_foundation::{write_atomic, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::trace;

/// Execution status reported in `progress.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressStatus {
    #[serde(rename = "in-progress", alias = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "waiting_for_human", alias = "waiting-for-human")]
    WaitingForHuman,
}

impl ProgressStatus {
    /// The environment considers its work finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::InProgress => "in-progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
            ProgressStatus::Blocked => "blocked",
            ProgressStatus::WaitingForHuman => "waiting_for_human",
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One checkpoint entry; `at` is kept verbatim as written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub at: String,
    pub description: String,
}

impl Checkpoint {
    pub fn now(description: impl Into<String>) -> Self {
        Self {
            at: chrono::Utc::now().to_rfc3339(),
            description: description.into(),
        }
    }
}

/// Contents of `progress.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub task_id: String,

    pub status: ProgressStatus,

    #[serde(default)]
    pub summary: String,

    /// 0-100; not required to be monotonic
    #[serde(default)]
    pub percent_complete: f64,

    /// Accumulates, never truncated
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,

    /// Present only with `waiting_for_human`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,

    /// Resumption token reported by the environment, persisted as the task's session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ProgressSnapshot {
    pub fn new(task_id: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            summary: String::new(),
            percent_complete: 0.0,
            checkpoints: Vec::new(),
            question: None,
            artifact_ref: None,
            session_id: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent_complete = percent;
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    pub fn with_artifact_ref(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// A question for the operator, if the environment is waiting on one
    pub fn pending_question(&self) -> Option<&str> {
        if self.status == ProgressStatus::WaitingForHuman {
            Some(self.question.as_deref().unwrap_or("(no question given)"))
        } else {
            None
        }
    }

    /// Parse a snapshot file; a missing or partially written file is "no update yet"
    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                trace!(path = %path.display(), error = %e, "Unparseable progress snapshot");
                None
            }
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(path, content.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_environment_document() {
        let raw = r#"{
            "taskId": "task-1",
            "status": "waiting_for_human",
            "summary": "drafted two versions",
            "percentComplete": 60,
            "checkpoints": [{"at": "2024-05-01T10:00:00Z", "description": "outline"}],
            "question": "Use tone A or B?"
        }"#;
        let snapshot: ProgressSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.status, ProgressStatus::WaitingForHuman);
        assert_eq!(snapshot.pending_question(), Some("Use tone A or B?"));
        assert_eq!(snapshot.checkpoints.len(), 1);
        assert_eq!(snapshot.percent_complete, 60.0);
    }

    #[test]
    fn test_status_names() {
        let parsed: ProgressStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(parsed, ProgressStatus::InProgress);
        assert_eq!(
            serde_json::to_string(&ProgressStatus::WaitingForHuman).unwrap(),
            "\"waiting_for_human\""
        );
    }

    #[test]
    fn test_truncated_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, r#"{"taskId": "task-1", "sta"#).unwrap();
        assert!(ProgressSnapshot::read(&path).is_none());

        ProgressSnapshot::new("task-1", ProgressStatus::Completed)
            .write(&path)
            .unwrap();
        let snapshot = ProgressSnapshot::read(&path).unwrap();
        assert_eq!(snapshot.status, ProgressStatus::Completed);
        assert!(snapshot.pending_question().is_none());
    }
}
