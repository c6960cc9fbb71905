//! Assignment collaborator seam
//!
//! The engine never decides *how* a pending task is assigned. It hands the
//! collaborator a view of pending tasks and available executors and applies
//! the decisions it returns through `TaskStore::assign`.

use async_trait::async_trait;
use hive_foundation::{Result, RuntimeKind};
use hive_task::{Assignment, Task, TaskId};
use std::path::Path;

/// Actor used when no actor directories exist
pub const DEFAULT_EXECUTOR: &str = "default";

/// Read view handed to the collaborator
#[derive(Debug, Clone)]
pub struct AssignmentView {
    pub pending: Vec<Task>,
    pub executors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentDecision {
    pub task_id: TaskId,
    pub assignment: Assignment,
}

#[async_trait]
pub trait AssignmentCollaborator: Send + Sync {
    fn name(&self) -> &str;

    /// Decide assignments; tasks left out stay pending until the next tick
    async fn assign(&self, view: AssignmentView) -> Result<Vec<AssignmentDecision>>;
}

/// Fallback when no collaborator is configured: every pending task goes to
/// the first executor on the configured default runtime
#[derive(Debug, Clone, Default)]
pub struct AutoAssigner {
    runtime: Option<RuntimeKind>,
}

impl AutoAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(runtime: RuntimeKind) -> Self {
        Self {
            runtime: Some(runtime),
        }
    }
}

#[async_trait]
impl AssignmentCollaborator for AutoAssigner {
    fn name(&self) -> &str {
        "auto"
    }

    async fn assign(&self, view: AssignmentView) -> Result<Vec<AssignmentDecision>> {
        let executor = view
            .executors
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_EXECUTOR.to_string());

        Ok(view
            .pending
            .into_iter()
            .map(|task| {
                let mut assignment = Assignment::new(vec![executor.clone()]);
                assignment.runtime = self.runtime;
                AssignmentDecision {
                    task_id: task.id,
                    assignment,
                }
            })
            .collect())
    }
}

/// Actor names: subdirectories of the actors directory, sorted
pub fn available_executors(actors_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(actors_dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_dir())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .filter(|name| !name.starts_with('.'))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    if names.is_empty() {
        names.push(DEFAULT_EXECUTOR.to_string());
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_task::TaskSpec;

    #[tokio::test]
    async fn test_auto_assigner_uses_first_executor() {
        let tasks = vec![
            Task::from_spec(TaskSpec::new("a", "")),
            Task::from_spec(TaskSpec::new("b", "")),
        ];
        let decisions = AutoAssigner::with_runtime(RuntimeKind::Sandbox)
            .assign(AssignmentView {
                pending: tasks.clone(),
                executors: vec!["alice".into(), "bob".into()],
            })
            .await
            .unwrap();

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[1].task_id, tasks[1].id);
        assert_eq!(decisions[0].assignment.assignees, vec!["alice".to_string()]);
        assert_eq!(decisions[0].assignment.runtime, Some(RuntimeKind::Sandbox));
    }

    #[test]
    fn test_available_executors() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            available_executors(&dir.path().join("missing")),
            vec![DEFAULT_EXECUTOR.to_string()]
        );

        std::fs::create_dir(dir.path().join("writer")).unwrap();
        std::fs::create_dir(dir.path().join("analyst")).unwrap();
        std::fs::create_dir(dir.path().join(".cache")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert_eq!(
            available_executors(dir.path()),
            vec!["analyst".to_string(), "writer".to_string()]
        );
    }
}
