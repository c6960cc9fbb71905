//! Execution collaborator seam for the in-process adapter
//!
//! The collaborator does the actual work one atomic turn at a time. The
//! adapter owns everything around it: session persistence, progress files,
//! inbox delivery, child contexts and cancellation.

use super::tree::{ChildReport, ChildSpec};
use crate::task::Task;
use async_trait::async_trait;
use hive_foundation::Result;
use serde::{Deserialize, Serialize};

/// Input for one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub task: Task,

    /// `root` or a child context id
    pub context_id: String,

    /// 0 for the root context
    pub depth: u32,

    /// What this context is asked to do
    pub instructions: String,

    /// Resumable session from the previous turn (or a prior process)
    pub session_id: Option<String>,

    /// 1-based turn counter within this run of the context
    pub turn: u32,

    /// Inbox messages delivered since the previous turn
    pub messages: Vec<String>,

    /// Reports from direct children finished since the previous turn
    pub child_reports: Vec<ChildReport>,
}

/// How a turn left the context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Continue,
    Completed,
    Failed,
    WaitingForHuman,
}

/// Result of one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub status: TurnStatus,

    /// Refreshed session handle
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub percent_complete: Option<f64>,

    /// Required with `WaitingForHuman`
    #[serde(default)]
    pub question: Option<String>,

    #[serde(default)]
    pub artifact_ref: Option<String>,

    /// Child contexts to start
    #[serde(default)]
    pub spawn: Vec<ChildSpec>,
}

impl TurnOutcome {
    pub fn new(status: TurnStatus, summary: impl Into<String>) -> Self {
        Self {
            status,
            session_id: None,
            summary: summary.into(),
            percent_complete: None,
            question: None,
            artifact_ref: None,
            spawn: Vec::new(),
        }
    }

    pub fn continuing(summary: impl Into<String>) -> Self {
        Self::new(TurnStatus::Continue, summary)
    }

    pub fn completed(summary: impl Into<String>) -> Self {
        Self::new(TurnStatus::Completed, summary)
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self::new(TurnStatus::Failed, summary)
    }

    pub fn waiting(question: impl Into<String>) -> Self {
        let question = question.into();
        let mut outcome = Self::new(TurnStatus::WaitingForHuman, question.clone());
        outcome.question = Some(question);
        outcome
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent_complete = Some(percent);
        self
    }

    pub fn with_artifact_ref(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }

    pub fn spawning(mut self, child: ChildSpec) -> Self {
        self.spawn.push(child);
        self
    }
}

/// Performs execution turns inside the control-plane process
#[async_trait]
pub trait ExecutionCollaborator: Send + Sync {
    /// Collaborator name (for logs)
    fn name(&self) -> &str;

    /// Run one atomic turn. Transient failures should be reported with
    /// retryable errors (`Error::transient`, `Timeout`, `RateLimited`).
    async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome>;
}
