//! Where task-spawning cron jobs put their tasks

use async_trait::async_trait;
use hive_foundation::Result;
use hive_task::{TaskId, TaskSpec, TaskStore};

#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId>;
}

#[async_trait]
impl TaskSink for TaskStore {
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId> {
        TaskStore::enqueue(self, spec).map(|task| task.id)
    }
}
