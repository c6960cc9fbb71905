//! Task Store - durable record of every task
//!
//! A single JSON document (`tasks.json`) is the source of truth for task
//! state. Every mutation is a whole-document read-modify-write; the in-process
//! lock only serializes writers inside this process, so concurrent writers
//! from other processes are last-writer-wins.

use crate::state::TaskStatus;
use crate::task::{Assignment, Task, TaskId, TaskSpec};
use hive_foundation::{Error, JsonStore, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Task document file name
pub const TASKS_FILE: &str = "tasks.json";

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    tasks: Vec<Task>,
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

impl Default for TaskDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            tasks: Vec::new(),
        }
    }
}

/// Durable task list
#[derive(Debug)]
pub struct TaskStore {
    store: JsonStore,
    write_lock: Mutex<()>,
}

impl TaskStore {
    /// Open (or lazily create) the store under `data_dir`
    pub fn open(data_dir: impl AsRef<Path>) -> Self {
        Self {
            store: JsonStore::new(data_dir.as_ref()),
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<TaskDocument> {
        Ok(self
            .store
            .load_optional::<TaskDocument>(TASKS_FILE)?
            .unwrap_or_default())
    }

    fn save(&self, doc: &TaskDocument) -> Result<()> {
        self.store.save(TASKS_FILE, doc)
    }

    /// Read-modify-write one task
    fn update<F>(&self, id: &TaskId, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let _guard = self.write_lock.lock();
        let mut doc = self.load()?;
        let task = doc
            .tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
        f(task)?;
        let updated = task.clone();
        self.save(&doc)?;
        Ok(updated)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Create a pending task
    pub fn enqueue(&self, spec: TaskSpec) -> Result<Task> {
        if spec.title.trim().is_empty() {
            return Err(Error::InvalidInput("task title is empty".to_string()));
        }
        let task = Task::from_spec(spec);

        let _guard = self.write_lock.lock();
        let mut doc = self.load()?;
        doc.tasks.push(task.clone());
        self.save(&doc)?;

        info!(task_id = %task.id, title = %task.title, "Task enqueued");
        Ok(task)
    }

    pub fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.load()?.tasks.into_iter().find(|t| &t.id == id))
    }

    pub fn list(&self) -> Result<Vec<Task>> {
        Ok(self.load()?.tasks)
    }

    /// Tasks in `status`, highest priority first, then oldest first
    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .load()?
            .tasks
            .into_iter()
            .filter(|t| t.status == status)
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Move a task forward; `completedAt` is only set on `completed`
    pub fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        assignees: Option<Vec<String>>,
    ) -> Result<Task> {
        let task = self.update(id, |task| {
            if !task.status.can_transition_to(status) {
                return Err(Error::invalid_transition(task.status, status));
            }
            if let Some(assignees) = assignees {
                task.assignment
                    .get_or_insert_with(Assignment::default)
                    .assignees = assignees;
            }
            task.set_status(status);
            Ok(())
        })?;
        debug!(task_id = %id, status = %status, "Task status updated");
        Ok(task)
    }

    /// Record the executor choice and mark the task assigned
    pub fn assign(&self, id: &TaskId, assignment: Assignment) -> Result<Task> {
        self.update(id, |task| {
            if !task.status.can_transition_to(TaskStatus::Assigned) {
                return Err(Error::invalid_transition(task.status, TaskStatus::Assigned));
            }
            task.assignment = Some(assignment);
            task.set_status(TaskStatus::Assigned);
            Ok(())
        })
    }

    /// Re-run a finished task with human feedback.
    ///
    /// Returns `None` without touching the document when the task is not
    /// `completed`/`failed` or a runner is still active for it.
    pub fn revise_task(
        &self,
        id: &TaskId,
        feedback: impl Into<String>,
        runner_active: bool,
    ) -> Result<Option<Task>> {
        if runner_active {
            debug!(task_id = %id, "Revision refused: runner active");
            return Ok(None);
        }

        let _guard = self.write_lock.lock();
        let mut doc = self.load()?;
        let Some(task) = doc.tasks.iter_mut().find(|t| &t.id == id) else {
            return Err(Error::NotFound(format!("task {}", id)));
        };
        if !task.status.is_terminal() {
            debug!(task_id = %id, status = %task.status, "Revision refused: not finished");
            return Ok(None);
        }

        task.status = TaskStatus::Assigned;
        task.revision_count += 1;
        task.revision_note = Some(feedback.into());
        task.completed_at = None;
        task.failure_reason = None;
        task.sandbox_handle = None;
        task.touch();
        let revised = task.clone();
        self.save(&doc)?;

        info!(task_id = %id, revision = revised.revision_count, "Task revised");
        Ok(Some(revised))
    }

    /// Mark a task failed with a reason
    pub fn record_failure(&self, id: &TaskId, reason: impl Into<String>) -> Result<Task> {
        let reason = reason.into();
        self.update(id, |task| {
            if !task.status.can_transition_to(TaskStatus::Failed) {
                return Err(Error::invalid_transition(task.status, TaskStatus::Failed));
            }
            task.failure_reason = Some(reason);
            task.set_status(TaskStatus::Failed);
            Ok(())
        })
    }

    pub fn set_sandbox_handle(&self, id: &TaskId, handle: Option<String>) -> Result<Task> {
        self.update(id, |task| {
            task.sandbox_handle = handle;
            task.touch();
            Ok(())
        })
    }

    /// Persist an artifact reference (no-op write when unchanged)
    pub fn set_artifact_ref(&self, id: &TaskId, artifact_ref: impl Into<String>) -> Result<Task> {
        let artifact_ref = artifact_ref.into();
        if let Some(task) = self.get(id)? {
            if task.sandbox_artifact_ref.as_deref() == Some(artifact_ref.as_str()) {
                return Ok(task);
            }
        }
        self.update(id, |task| {
            task.sandbox_artifact_ref = Some(artifact_ref);
            task.touch();
            Ok(())
        })
    }

    pub fn set_thread_ref(&self, id: &TaskId, thread_ref: impl Into<String>) -> Result<Task> {
        let thread_ref = thread_ref.into();
        self.update(id, |task| {
            task.external_thread_ref = Some(thread_ref);
            task.touch();
            Ok(())
        })
    }
}
