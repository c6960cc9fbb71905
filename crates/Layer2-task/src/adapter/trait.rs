//! Runtime adapter trait

use crate::session::SessionStore;
use crate::store::TaskStore;
use crate::sync::{ProgressSnapshot, TaskFiles};
use crate::task::{Task, TaskId};
use async_trait::async_trait;
use hive_foundation::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle state shared by every adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl AdapterState {
    pub fn is_finished(&self) -> bool {
        matches!(self, AdapterState::Completed | AdapterState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterState::Idle => "idle",
            AdapterState::Running => "running",
            AdapterState::Paused => "paused",
            AdapterState::Completed => "completed",
            AdapterState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an adapter reports to its runner
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// Execution environment launched
    Started,

    /// A new progress snapshot was observed
    Progress(ProgressSnapshot),

    /// Session handle refreshed (already persisted)
    Checkpoint { session_id: String },

    Paused,

    Resumed,

    Completed { summary: String },

    /// Execution failed; `diagnostics` carries captured output when available
    Failed {
        reason: String,
        diagnostics: Option<String>,
    },
}

/// Everything an adapter needs from the engine
#[derive(Clone)]
pub struct AdapterContext {
    pub task_id: TaskId,
    pub store: Arc<TaskStore>,
    pub sessions: SessionStore,
    pub files: TaskFiles,
    pub events: mpsc::UnboundedSender<AdapterEvent>,
}

impl AdapterContext {
    /// Send an event; a closed channel means the runner is gone
    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }
}

/// Runtime adapter - implement to add new execution backends.
///
/// `start` must be called once. `pause` and `resume` are no-ops when the
/// adapter is already in the target state.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Adapter name (for logs)
    fn name(&self) -> &'static str;

    fn state(&self) -> AdapterState;

    /// Launch execution; returns once the environment is running
    async fn start(&self, task: &Task) -> Result<()>;

    /// Freeze execution in place
    async fn pause(&self) -> Result<()>;

    /// Continue a paused execution
    async fn resume(&self, task: &Task) -> Result<()>;

    /// Deliver a plain-text message to the execution environment
    async fn inject_message(&self, text: &str) -> Result<()>;

    /// Stop observing and free every resource held for the task
    async fn release(&self) -> Result<()>;
}

/// Builds the adapter for a task from its assigned runtime
pub trait AdapterFactory: Send + Sync {
    fn create(&self, task: &Task, ctx: AdapterContext) -> Result<Box<dyn RuntimeAdapter>>;
}
