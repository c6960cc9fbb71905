//! End-to-end scheduler scenarios against a scripted runtime adapter

use async_trait::async_trait;
use hive_cron::{CronPayload, CronSchedule, CronScheduler, NewCronJob, TaskSink};
use hive_engine::{Engine, InputRoute, InputScope, Signal, SignalFiles};
use hive_foundation::{CronSettings, Error, EventKind, HiveConfig, Result};
use hive_task::{
    AdapterContext, AdapterEvent, AdapterFactory, AdapterState, Assignment, CreatedBy,
    ProgressSnapshot, ProgressStatus, RuntimeAdapter, SessionStore, Task, TaskFiles, TaskId,
    TaskSpec, TaskStatus, TaskStore,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted adapter
// ============================================================================

struct Handle {
    ctx: AdapterContext,
    state: Arc<Mutex<AdapterState>>,
}

#[derive(Default)]
struct ScriptedFactory {
    handles: Mutex<HashMap<TaskId, Handle>>,
    log: Arc<Mutex<Vec<String>>>,
    start_delay: Duration,
    refuse: bool,
}

impl ScriptedFactory {
    fn slow(start_delay: Duration) -> Self {
        Self {
            start_delay,
            ..Default::default()
        }
    }

    fn refusing() -> Self {
        Self {
            refuse: true,
            ..Default::default()
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn emit(&self, id: &TaskId, event: AdapterEvent) {
        let handles = self.handles.lock();
        let handle = handles.get(id).unwrap();
        match &event {
            AdapterEvent::Completed { .. } => *handle.state.lock() = AdapterState::Completed,
            AdapterEvent::Failed { .. } => *handle.state.lock() = AdapterState::Failed,
            _ => {}
        }
        handle.ctx.emit(event);
    }

    fn ask(&self, id: &TaskId, question: &str) {
        self.emit(
            id,
            AdapterEvent::Progress(
                ProgressSnapshot::new(id.as_str(), ProgressStatus::WaitingForHuman)
                    .with_question(question),
            ),
        );
    }

    fn carry_on(&self, id: &TaskId) {
        self.emit(
            id,
            AdapterEvent::Progress(
                ProgressSnapshot::new(id.as_str(), ProgressStatus::InProgress)
                    .with_summary("drafting")
                    .with_percent(40.0),
            ),
        );
    }

    fn complete(&self, id: &TaskId) {
        self.emit(
            id,
            AdapterEvent::Completed {
                summary: "done".into(),
            },
        );
    }
}

impl AdapterFactory for ScriptedFactory {
    fn create(&self, task: &Task, ctx: AdapterContext) -> Result<Box<dyn RuntimeAdapter>> {
        if self.refuse {
            return Err(Error::Adapter("no runtime for this task".into()));
        }
        let state = Arc::new(Mutex::new(AdapterState::Idle));
        self.handles.lock().insert(
            task.id.clone(),
            Handle {
                ctx: ctx.clone(),
                state: Arc::clone(&state),
            },
        );
        Ok(Box::new(ScriptedAdapter {
            ctx,
            state,
            log: Arc::clone(&self.log),
            start_delay: self.start_delay,
        }))
    }
}

struct ScriptedAdapter {
    ctx: AdapterContext,
    state: Arc<Mutex<AdapterState>>,
    log: Arc<Mutex<Vec<String>>>,
    start_delay: Duration,
}

impl ScriptedAdapter {
    fn record(&self, what: &str) {
        self.log.lock().push(format!("{}:{}", what, self.ctx.task_id));
    }
}

#[async_trait]
impl RuntimeAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    async fn start(&self, _task: &Task) -> Result<()> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.record("start");
        *self.state.lock() = AdapterState::Running;
        let session_id = format!("sess-{}", self.ctx.task_id);
        self.ctx.sessions.save(&self.ctx.task_id, &session_id)?;
        self.ctx.emit(AdapterEvent::Started);
        self.ctx.emit(AdapterEvent::Checkpoint { session_id });
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.record("pause");
        *self.state.lock() = AdapterState::Paused;
        self.ctx.emit(AdapterEvent::Paused);
        Ok(())
    }

    async fn resume(&self, _task: &Task) -> Result<()> {
        self.record("resume");
        *self.state.lock() = AdapterState::Running;
        self.ctx.emit(AdapterEvent::Resumed);
        Ok(())
    }

    async fn inject_message(&self, text: &str) -> Result<()> {
        self.ctx.files.push_inbox(text)
    }

    async fn release(&self) -> Result<()> {
        self.record("release");
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn engine(dir: &Path, factory: Arc<ScriptedFactory>) -> Engine {
    let config = HiveConfig::default().with_data_dir(dir);
    Engine::new(config, factory)
}

/// Let runner pumps and assignment jobs run, then apply their events
async fn settle(engine: &Engine) {
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.process_runner_events().await;
    }
}

/// Enqueue a task and tick until its runner is up
async fn running_task(engine: &Engine, title: &str) -> TaskId {
    let task = engine.enqueue(TaskSpec::new(title, "")).await.unwrap();
    for _ in 0..3 {
        engine.tick().await;
        settle(engine).await;
    }
    let stored = engine.store().get(&task.id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);
    task.id
}

fn status(engine: &Engine, id: &TaskId) -> TaskStatus {
    engine.store().get(id).unwrap().unwrap().status
}

fn inbox(dir: &Path, id: &TaskId) -> Vec<String> {
    TaskFiles::new(dir, id).peek_inbox()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_pending_task_is_auto_assigned_and_started() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());

    let id = running_task(&engine, "Summarize logs").await;

    let task = engine.store().get(&id).unwrap().unwrap();
    assert_eq!(task.assignees(), ["default".to_string()]);
    assert!(engine.has_runner(&id).await);
    assert_eq!(factory.log(), vec![format!("start:{}", id)]);
    assert_eq!(engine.snapshot().active_runners, vec![id.clone()]);

    let kinds: Vec<EventKind> = engine
        .events()
        .history_for(id.as_str())
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![EventKind::Enqueued, EventKind::Assigned, EventKind::Started]
    );
}

#[tokio::test]
async fn test_completed_runner_is_evicted_and_released() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    let id = running_task(&engine, "Write report").await;

    factory.complete(&id);
    settle(&engine).await;

    assert_eq!(status(&engine, &id), TaskStatus::Completed);
    assert!(!engine.has_runner(&id).await);
    assert!(factory.log().contains(&format!("release:{}", id)));
}

#[tokio::test]
async fn test_adapter_creation_failure_marks_task_failed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), Arc::new(ScriptedFactory::refusing()));

    let task = engine.enqueue(TaskSpec::new("Doomed", "")).await.unwrap();
    for _ in 0..3 {
        engine.tick().await;
        settle(&engine).await;
    }

    let stored = engine.store().get(&task.id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored
        .failure_reason
        .unwrap()
        .contains("no runtime for this task"));
    assert!(!engine.has_runner(&task.id).await);
}

#[tokio::test]
async fn test_tick_is_skipped_while_previous_tick_runs() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::slow(Duration::from_millis(300)));
    let engine = engine(dir.path(), factory.clone());

    engine.enqueue(TaskSpec::new("Slow start", "")).await.unwrap();
    engine.tick().await;
    settle(&engine).await;

    let (first, second) = tokio::join!(engine.tick(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.tick().await
    });
    assert_eq!((first, second), (true, false));
    assert_eq!(engine.snapshot().skipped_ticks, 1);
    assert_eq!(factory.log().len(), 1);
}

#[tokio::test]
async fn test_hard_freeze_pauses_and_resume_continues() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    let id = running_task(&engine, "Long job").await;

    engine.signal(Signal::freeze_all(Some("maintenance".into())));
    engine.tick().await;
    settle(&engine).await;

    assert!(engine.state().is_frozen());
    assert_eq!(status(&engine, &id), TaskStatus::Paused);
    assert!(SessionStore::open(dir.path()).exists(&id));

    // nothing new starts while frozen
    let waiting = engine.enqueue(TaskSpec::new("Queued", "")).await.unwrap();
    engine.tick().await;
    settle(&engine).await;
    assert_eq!(status(&engine, &waiting.id), TaskStatus::Pending);

    engine.signal(Signal::resume_all());
    engine.tick().await;
    settle(&engine).await;

    assert!(!engine.state().is_frozen());
    assert_eq!(status(&engine, &id), TaskStatus::InProgress);
    assert_eq!(
        factory.log()[..3].to_vec(),
        vec![
            format!("start:{}", id),
            format!("pause:{}", id),
            format!("resume:{}", id)
        ]
    );
    let stored = engine.store().get(&id).unwrap().unwrap();
    assert!(stored.failure_reason.is_none());
}

#[tokio::test]
async fn test_task_freeze_survives_global_resume() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    let id = running_task(&engine, "Pinned").await;

    engine.signal(Signal::freeze_task(id.clone()));
    engine.signal(Signal::freeze_all(None));
    engine.tick().await;
    settle(&engine).await;
    assert_eq!(status(&engine, &id), TaskStatus::Paused);

    engine.signal(Signal::resume_all());
    engine.tick().await;
    settle(&engine).await;
    assert!(!engine.state().is_frozen());
    assert_eq!(status(&engine, &id), TaskStatus::Paused);
    assert_eq!(engine.snapshot().frozen_tasks, vec![id.clone()]);

    engine.signal(Signal::resume_task(id.clone()));
    engine.tick().await;
    settle(&engine).await;
    assert_eq!(status(&engine, &id), TaskStatus::InProgress);
}

#[tokio::test]
async fn test_signal_files_from_another_process() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    let id = running_task(&engine, "Watched").await;

    SignalFiles::new(dir.path())
        .send(&Signal::freeze_all(None))
        .unwrap();
    engine.tick().await;
    settle(&engine).await;

    assert!(engine.state().is_frozen());
    assert_eq!(status(&engine, &id), TaskStatus::Paused);
    assert!(SignalFiles::new(dir.path()).drain().unwrap().is_empty());
}

#[tokio::test]
async fn test_rest_advises_runners_until_day_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    let id = running_task(&engine, "Evening work").await;

    engine.signal(Signal::Rest);
    engine.tick().await;

    assert!(engine.state().is_resting());
    assert_eq!(status(&engine, &id), TaskStatus::InProgress);
    let messages = inbox(dir.path(), &id);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("called it a day"));

    engine.signal(Signal::DayBoundary);
    engine.tick().await;
    assert!(!engine.state().is_resting());
}

#[tokio::test]
async fn test_alignment_routes_input_and_auto_exits() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    let id = running_task(&engine, "Draft announcement").await;

    factory.ask(&id, "Formal or casual tone?");
    settle(&engine).await;

    let session = engine.alignment().unwrap();
    assert_eq!(session.task_id, id);
    assert_eq!(session.question, "Formal or casual tone?");

    let route = engine
        .operator_input(InputScope::Global, "Formal, please")
        .await
        .unwrap();
    assert_eq!(route, InputRoute::Alignment(id.clone()));
    assert_eq!(inbox(dir.path(), &id), vec!["Formal, please".to_string()]);

    factory.carry_on(&id);
    settle(&engine).await;
    assert!(engine.alignment().is_none());

    let kinds: Vec<EventKind> = engine
        .events()
        .history_for(id.as_str())
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&EventKind::Question));
    assert!(kinds.contains(&EventKind::AlignmentStarted));
    assert!(kinds.contains(&EventKind::AlignmentEnded));

    // out of alignment, global text is a new task again
    let route = engine
        .operator_input(InputScope::Global, "Book the venue")
        .await
        .unwrap();
    assert!(matches!(route, InputRoute::NewTask(_)));
}

#[tokio::test]
async fn test_second_question_waits_for_current_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    let first = running_task(&engine, "First").await;
    let second = running_task(&engine, "Second").await;

    factory.ask(&first, "Which client?");
    settle(&engine).await;
    factory.ask(&second, "Which region?");
    settle(&engine).await;
    assert_eq!(engine.alignment().unwrap().task_id, first);

    let route = engine
        .operator_input(InputScope::Global, "/end")
        .await
        .unwrap();
    assert_eq!(route, InputRoute::AlignmentEnded(first.clone()));
    assert!(inbox(dir.path(), &first)[0].contains("Use your own judgment"));

    let session = engine.alignment().unwrap();
    assert_eq!(session.task_id, second);
    assert_eq!(session.question, "Which region?");
}

#[tokio::test]
async fn test_request_and_end_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    let id = running_task(&engine, "Migrate data").await;
    let files = TaskFiles::new(dir.path(), &id);

    engine
        .request_alignment(&id, "check the schema with me first")
        .await
        .unwrap();
    assert!(files.read_pause_signal().is_some());
    assert!(files.peek_inbox()[0].contains("check the schema with me first"));

    // nothing to end until the task actually asks
    assert_eq!(engine.end_alignment().await.unwrap(), None);

    factory.ask(&id, "Drop the legacy column?");
    settle(&engine).await;
    assert_eq!(engine.end_alignment().await.unwrap(), Some(id.clone()));
    assert!(engine.alignment().is_none());
    assert!(files.read_pause_signal().is_none());
    assert!(files
        .peek_inbox()
        .last()
        .unwrap()
        .contains("Use your own judgment"));

    assert!(matches!(
        engine
            .request_alignment(&TaskId::from("task-missing"), "hello")
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_operator_input_routes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), Arc::new(ScriptedFactory::default()));

    let route = engine
        .operator_input(InputScope::Global, "Draft announcement\nfor the launch")
        .await
        .unwrap();
    let id = match route {
        InputRoute::NewTask(id) => id,
        other => panic!("expected a new task, got {:?}", other),
    };
    let task = engine.store().get(&id).unwrap().unwrap();
    assert_eq!(task.title, "Draft announcement");
    assert_eq!(task.created_by, CreatedBy::Human);

    let route = engine
        .operator_input(InputScope::Task(id.clone()), "include the date")
        .await
        .unwrap();
    assert_eq!(route, InputRoute::TaskInbox(id.clone()));
    assert_eq!(inbox(dir.path(), &id), vec!["include the date".to_string()]);

    let route = engine
        .operator_input(InputScope::Global, "/freeze lunch")
        .await
        .unwrap();
    assert_eq!(route, InputRoute::Signal(Signal::freeze_all(Some("lunch".into()))));
    engine.tick().await;
    assert!(engine.state().is_frozen());

    assert!(matches!(
        engine.operator_input(InputScope::Global, "   ").await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        engine
            .operator_input(InputScope::Task(TaskId::from("task-missing")), "hi")
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_revise_only_after_runner_finished() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    let id = running_task(&engine, "Write copy").await;

    assert!(engine.revise(&id, "shorter").await.unwrap().is_none());

    factory.complete(&id);
    settle(&engine).await;

    let revised = engine.revise(&id, "shorter").await.unwrap().unwrap();
    assert_eq!(revised.revision_count, 1);
    assert_eq!(revised.status, TaskStatus::Assigned);

    engine.tick().await;
    settle(&engine).await;
    assert_eq!(status(&engine, &id), TaskStatus::InProgress);
    assert_eq!(
        factory
            .log()
            .iter()
            .filter(|line| **line == format!("start:{}", id))
            .count(),
        2
    );
}

#[tokio::test]
async fn test_crash_recovery_resumes_orphaned_tasks() {
    let dir = tempfile::tempdir().unwrap();

    // state a crashed process would leave behind
    let store = TaskStore::open(dir.path());
    let mut orphans = Vec::new();
    for title in ["with session", "without session"] {
        let task = store.enqueue(TaskSpec::new(title, "")).unwrap();
        store
            .assign(&task.id, Assignment::new(vec!["default".into()]))
            .unwrap();
        store
            .update_status(&task.id, TaskStatus::InProgress, None)
            .unwrap();
        orphans.push(task.id);
    }
    SessionStore::open(dir.path())
        .save(&orphans[0], "sess-1")
        .unwrap();

    let factory = Arc::new(ScriptedFactory::default());
    let engine = engine(dir.path(), factory.clone());
    engine.tick().await;
    settle(&engine).await;

    for id in &orphans {
        assert!(engine.has_runner(id).await);
        assert_eq!(status(&engine, id), TaskStatus::InProgress);
    }

    let messages = |events: Vec<hive_foundation::TaskEvent>| -> Vec<String> {
        events
            .into_iter()
            .filter(|e| e.kind == EventKind::System)
            .map(|e| e.message)
            .collect()
    };
    let resumed = messages(engine.events().history_for(orphans[0].as_str()).await);
    assert_eq!(resumed, vec!["recovered after restart, resuming session"]);
    let restarted = messages(engine.events().history_for(orphans[1].as_str()).await);
    assert_eq!(restarted, vec!["recovered after restart, starting over"]);

    // recovery happens once
    engine.tick().await;
    settle(&engine).await;
    assert_eq!(factory.log().len(), 2);
}

#[tokio::test]
async fn test_run_loop_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let mut config = HiveConfig::default().with_data_dir(dir.path());
    config.tick_interval_ms = 20;
    let engine = Arc::new(Engine::new(config, factory.clone()));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));

    let task = engine.enqueue(TaskSpec::new("Background", "")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while status(&engine, &task.id) != TaskStatus::InProgress {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    factory.complete(&task.id);
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.has_runner(&task.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status(&engine, &task.id), TaskStatus::Completed);
    assert!(engine.active_runners().await.is_empty());

    // the queue outlives the loop; a late signal applies on the next manual tick
    engine.signal(Signal::freeze_all(Some("after hours".into())));
    assert!(engine.tick().await);
    assert!(engine.state().is_frozen());
}

#[tokio::test]
async fn test_cron_jobs_enqueue_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine(dir.path(), Arc::new(ScriptedFactory::default())));
    let cron = CronScheduler::new(
        dir.path(),
        Arc::clone(&engine) as Arc<dyn TaskSink>,
        CronSettings::default(),
    )
    .with_events(Arc::clone(engine.events()));

    let job = cron
        .add(NewCronJob::new(
            "standup notes",
            CronSchedule::cron("0 9 * * 1-5", None),
            CronPayload::task("Collect standup notes", ""),
        ))
        .unwrap();
    let record = cron.run_now(&job.id).await.unwrap();
    let task_id = record.task_id.unwrap();

    let task = engine.store().get(&task_id).unwrap().unwrap();
    assert_eq!(task.created_by, CreatedBy::Cron);
    assert_eq!(task.status, TaskStatus::Pending);

    let kinds: Vec<EventKind> = engine
        .events()
        .history_for(task_id.as_str())
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EventKind::Enqueued, EventKind::CronFired]);
}
