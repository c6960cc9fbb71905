//! Task definition and types

use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use hive_foundation::RuntimeKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(format!("task-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::str::FromStr for Priority {
    type Err = hive_foundation::Error;

    fn from_str(s: &str) -> hive_foundation::Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(hive_foundation::Error::InvalidInput(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

/// Who created a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CreatedBy {
    #[default]
    Human,
    InternalPlanner,
    Cron,
}

/// Executor choice recorded when a task is assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Actors responsible for the task (the first one owns the private mounts)
    pub assignees: Vec<String>,

    /// Runtime the task executes in (`None` = configured default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeKind>,
}

impl Assignment {
    pub fn new(assignees: Vec<String>) -> Self {
        Self {
            assignees,
            runtime: None,
        }
    }

    pub fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

/// Input to `TaskStore::enqueue`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub created_by: CreatedBy,
    pub dependencies: BTreeSet<TaskId>,
    pub requires_plan_approval: bool,
    pub external_thread_ref: Option<String>,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn created_by(mut self, created_by: CreatedBy) -> Self {
        self.created_by = created_by;
        self
    }

    pub fn with_thread_ref(mut self, thread_ref: impl Into<String>) -> Self {
        self.external_thread_ref = Some(thread_ref.into());
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }
}

/// A unit of schedulable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    pub title: String,

    pub description: String,

    pub status: TaskStatus,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub created_by: CreatedBy,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Informational only; never gates scheduling
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,

    #[serde(default)]
    pub requires_plan_approval: bool,

    /// Incremented on every revision
    #[serde(default)]
    pub revision_count: u32,

    /// Human feedback from the last revision
    #[serde(default)]
    pub revision_note: Option<String>,

    /// Executor choice
    #[serde(default)]
    pub assignment: Option<Assignment>,

    /// Isolated execution environment (container id)
    #[serde(default)]
    pub sandbox_handle: Option<String>,

    /// Durable artifact location created for this task
    #[serde(default)]
    pub sandbox_artifact_ref: Option<String>,

    /// Notification thread to reuse
    #[serde(default)]
    pub external_thread_ref: Option<String>,

    /// Why the task last failed
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Task {
    /// Create a pending task from a spec
    pub fn from_spec(spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: spec.title,
            description: spec.description,
            status: TaskStatus::Pending,
            priority: spec.priority,
            created_by: spec.created_by,
            created_at: now,
            updated_at: now,
            completed_at: None,
            dependencies: spec.dependencies,
            requires_plan_approval: spec.requires_plan_approval,
            revision_count: 0,
            revision_note: None,
            assignment: None,
            sandbox_handle: None,
            sandbox_artifact_ref: None,
            external_thread_ref: spec.external_thread_ref,
            failure_reason: None,
        }
    }

    /// Runtime chosen at assignment, if any
    pub fn runtime(&self) -> Option<RuntimeKind> {
        self.assignment.as_ref().and_then(|a| a.runtime)
    }

    /// Assigned actors
    pub fn assignees(&self) -> &[String] {
        self.assignment
            .as_ref()
            .map(|a| a.assignees.as_slice())
            .unwrap_or(&[])
    }

    /// Primary actor (owns the private mounts)
    pub fn primary_assignee(&self) -> Option<&str> {
        self.assignees().first().map(|s| s.as_str())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Apply a validated status change
    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        if status == TaskStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
        self.touch();
    }
}
