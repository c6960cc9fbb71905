//! Task Runner - one per active task
//!
//! Owns exactly one adapter and mirrors its lifecycle into the Task Store.
//! Adapter events are applied to the store first and then forwarded to the
//! engine as `RunnerEvent`s, so the engine always observes persisted state.

use crate::adapter::{AdapterContext, AdapterEvent, AdapterFactory, AdapterState, RuntimeAdapter};
use crate::session::SessionStore;
use crate::state::TaskStatus;
use crate::store::TaskStore;
use crate::sync::TaskFiles;
use crate::task::{Task, TaskId};
use hive_foundation::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Adapter event tagged with its task
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerEvent {
    pub task_id: TaskId,
    pub event: AdapterEvent,
}

impl RunnerEvent {
    /// The runner reached a terminal state and can be evicted
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event,
            AdapterEvent::Completed { .. } | AdapterEvent::Failed { .. }
        )
    }
}

pub struct TaskRunner {
    task_id: TaskId,
    adapter: Box<dyn RuntimeAdapter>,
    store: Arc<TaskStore>,
}

impl TaskRunner {
    /// Build the adapter for `task` and start mirroring its events
    pub fn new(
        task: &Task,
        factory: &dyn AdapterFactory,
        store: Arc<TaskStore>,
        data_dir: &Path,
        engine_events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = AdapterContext {
            task_id: task.id.clone(),
            store: Arc::clone(&store),
            sessions: SessionStore::open(data_dir),
            files: TaskFiles::new(data_dir, &task.id),
            events: tx,
        };
        let adapter = factory.create(task, ctx)?;
        debug!(task_id = %task.id, adapter = adapter.name(), "Runner created");

        tokio::spawn(pump(task.id.clone(), rx, Arc::clone(&store), engine_events));

        Ok(Self {
            task_id: task.id.clone(),
            adapter,
            store,
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub fn state(&self) -> AdapterState {
        self.adapter.state()
    }

    pub fn is_running(&self) -> bool {
        self.adapter.state() == AdapterState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.adapter.state() == AdapterState::Paused
    }

    pub fn is_finished(&self) -> bool {
        self.adapter.state().is_finished()
    }

    /// Start execution; a launch failure marks the task failed
    pub async fn start(&self, task: &Task) -> Result<()> {
        if let Err(e) = self.adapter.start(task).await {
            warn!(task_id = %task.id, error = %e, "Adapter failed to start");
            if let Err(store_err) = self
                .store
                .record_failure(&task.id, format!("failed to start: {}", e))
            {
                warn!(task_id = %task.id, error = %store_err, "Failed to record start failure");
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.adapter.pause().await
    }

    pub async fn resume(&self, task: &Task) -> Result<()> {
        self.adapter.resume(task).await
    }

    pub async fn inject_message(&self, text: &str) -> Result<()> {
        self.adapter.inject_message(text).await
    }

    pub async fn release(&self) -> Result<()> {
        debug!(task_id = %self.task_id, "Releasing runner");
        self.adapter.release().await
    }
}

/// Apply adapter events to the store, then forward them
async fn pump(
    task_id: TaskId,
    mut rx: mpsc::UnboundedReceiver<AdapterEvent>,
    store: Arc<TaskStore>,
    engine_events: mpsc::UnboundedSender<RunnerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let result = match &event {
            AdapterEvent::Started | AdapterEvent::Resumed => store
                .update_status(&task_id, TaskStatus::InProgress, None)
                .map(|_| ()),
            AdapterEvent::Paused => store
                .update_status(&task_id, TaskStatus::Paused, None)
                .map(|_| ()),
            AdapterEvent::Completed { .. } => store
                .update_status(&task_id, TaskStatus::Completed, None)
                .map(|_| ()),
            AdapterEvent::Failed { reason, .. } => {
                store.record_failure(&task_id, reason.as_str()).map(|_| ())
            }
            AdapterEvent::Progress(_) | AdapterEvent::Checkpoint { .. } => Ok(()),
        };
        if let Err(e) = result {
            warn!(task_id = %task_id, error = %e, "Failed to apply adapter event to task store");
        }

        if engine_events
            .send(RunnerEvent {
                task_id: task_id.clone(),
                event,
            })
            .is_err()
        {
            debug!(task_id = %task_id, "Engine channel closed, stopping runner pump");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Assignment, TaskSpec};
    use async_trait::async_trait;
    use hive_foundation::Error;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Completes immediately, or refuses to start
    struct InstantAdapter {
        ctx: AdapterContext,
        state: Mutex<AdapterState>,
        fail_start: bool,
    }

    #[async_trait]
    impl RuntimeAdapter for InstantAdapter {
        fn name(&self) -> &'static str {
            "instant"
        }

        fn state(&self) -> AdapterState {
            *self.state.lock()
        }

        async fn start(&self, _task: &Task) -> Result<()> {
            if self.fail_start {
                return Err(Error::Container("image not found".into()));
            }
            *self.state.lock() = AdapterState::Completed;
            self.ctx.emit(AdapterEvent::Started);
            self.ctx.emit(AdapterEvent::Completed {
                summary: "done".into(),
            });
            Ok(())
        }

        async fn pause(&self) -> Result<()> {
            Ok(())
        }

        async fn resume(&self, _task: &Task) -> Result<()> {
            Ok(())
        }

        async fn inject_message(&self, text: &str) -> Result<()> {
            self.ctx.files.push_inbox(text)
        }

        async fn release(&self) -> Result<()> {
            Ok(())
        }
    }

    struct InstantFactory {
        fail_start: bool,
    }

    impl AdapterFactory for InstantFactory {
        fn create(&self, _task: &Task, ctx: AdapterContext) -> Result<Box<dyn RuntimeAdapter>> {
            Ok(Box::new(InstantAdapter {
                ctx,
                state: Mutex::new(AdapterState::Idle),
                fail_start: self.fail_start,
            }))
        }
    }

    fn assigned_task(store: &TaskStore) -> Task {
        let task = store.enqueue(TaskSpec::new("t", "")).unwrap();
        store.assign(&task.id, Assignment::new(vec!["a".into()])).unwrap()
    }

    #[tokio::test]
    async fn test_events_update_store_before_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()));
        let task = assigned_task(&store);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let runner = TaskRunner::new(
            &task,
            &InstantFactory { fail_start: false },
            Arc::clone(&store),
            dir.path(),
            tx,
        )
        .unwrap();
        runner.start(&task).await.unwrap();

        let started = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.event, AdapterEvent::Started);

        let done = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(done.is_terminal());
        assert!(runner.is_finished());

        let stored = store.get(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_start_failure_marks_task_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()));
        let task = assigned_task(&store);
        let (tx, _rx) = mpsc::unbounded_channel();

        let runner = TaskRunner::new(
            &task,
            &InstantFactory { fail_start: true },
            Arc::clone(&store),
            dir.path(),
            tx,
        )
        .unwrap();
        assert!(runner.start(&task).await.is_err());

        let stored = store.get(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored
            .failure_reason
            .unwrap()
            .contains("image not found"));
    }
}
