//! Scheduler Loop
//!
//! A fixed-period, re-entrancy-guarded tick. Each tick, in order:
//! 1. apply runner events not yet handled
//! 2. drain signals (in-process queue + `signals/*.json`) and apply them
//! 3. stop here while globally frozen
//! 4. first unfrozen tick only: recover tasks left `in-progress`/`paused`
//! 5. start a runner for every `assigned` task without one
//! 6. hand `pending` tasks to the assignment collaborator (fire-and-forget)
//!
//! Runner events (started, progress, finished) are also handled as they
//! arrive by `run`, so alignment and eviction never wait for a tick.

use crate::assign::{
    available_executors, AssignmentCollaborator, AssignmentView, AutoAssigner,
};
use crate::input::{
    alignment_advisory, parse_command, title_from_text, InputRoute, InputScope,
    END_ALIGNMENT_COMMAND, INDEPENDENT_JUDGMENT, REST_ADVISORY,
};
use crate::signal::{Signal, SignalFiles, SignalScope};
use crate::state::{AlignmentSession, SchedulerSnapshot, SchedulerState};
use async_trait::async_trait;
use chrono::Utc;
use hive_cron::TaskSink;
use hive_foundation::{
    with_retry, Error, EventBus, EventKind, HiveConfig, Result, RetryConfig, TaskEvent, TickGuard,
};
use hive_task::{
    AdapterEvent, AdapterFactory, CreatedBy, ProgressSnapshot, RunnerEvent, SessionStore, Task,
    TaskFiles, TaskId, TaskRunner, TaskSpec, TaskStatus, TaskStore,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mutable scheduler flags; never held across an await
#[derive(Default)]
struct Control {
    state: SchedulerState,
    /// Task-scoped freezes; a global resume leaves these paused
    frozen_tasks: BTreeSet<TaskId>,
    alignment: Option<AlignmentSession>,
    /// Tasks waiting for a human while another alignment is open
    waiting: VecDeque<(TaskId, String)>,
}

pub struct Engine {
    config: HiveConfig,
    store: Arc<TaskStore>,
    sessions: SessionStore,
    factory: Arc<dyn AdapterFactory>,
    assigner: Arc<dyn AssignmentCollaborator>,
    events: Arc<EventBus>,

    signal_files: SignalFiles,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: Mutex<mpsc::UnboundedReceiver<Signal>>,

    /// Active runner registry: at most one runner per task id
    runners: RwLock<HashMap<TaskId, Arc<TaskRunner>>>,
    runner_tx: mpsc::UnboundedSender<RunnerEvent>,
    runner_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RunnerEvent>>,

    control: Mutex<Control>,
    guard: TickGuard,
    assigning: Arc<AtomicBool>,
    recovered: AtomicBool,
    snapshot: watch::Sender<SchedulerSnapshot>,
}

impl Engine {
    pub fn new(config: HiveConfig, factory: Arc<dyn AdapterFactory>) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(SchedulerSnapshot::default());

        Self {
            store: Arc::new(TaskStore::open(&config.data_dir)),
            sessions: SessionStore::open(&config.data_dir),
            signal_files: SignalFiles::new(&config.data_dir),
            assigner: Arc::new(AutoAssigner::with_runtime(config.default_runtime)),
            events: Arc::new(EventBus::new()),
            config,
            factory,
            signal_tx,
            signal_rx: Mutex::new(signal_rx),
            runners: RwLock::new(HashMap::new()),
            runner_tx,
            runner_rx: tokio::sync::Mutex::new(runner_rx),
            control: Mutex::new(Control::default()),
            guard: TickGuard::new(),
            assigning: Arc::new(AtomicBool::new(false)),
            recovered: AtomicBool::new(false),
            snapshot,
        }
    }

    /// Share a task store with other components
    pub fn with_store(mut self, store: Arc<TaskStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the built-in auto-assigner
    pub fn with_assigner(mut self, assigner: Arc<dyn AssignmentCollaborator>) -> Self {
        self.assigner = assigner;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SchedulerState {
        self.control.lock().state.clone()
    }

    pub fn alignment(&self) -> Option<AlignmentSession> {
        self.control.lock().alignment.clone()
    }

    pub async fn active_runners(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.runners.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn has_runner(&self, id: &TaskId) -> bool {
        self.runners.read().await.contains_key(id)
    }

    pub fn assignment_in_flight(&self) -> bool {
        self.assigning.load(Ordering::Acquire)
    }

    fn actors_dir(&self) -> PathBuf {
        self.config
            .sandbox
            .actors_dir
            .clone()
            .unwrap_or_else(|| self.config.data_dir.join("actors"))
    }

    fn files(&self, id: &TaskId) -> TaskFiles {
        TaskFiles::new(&self.config.data_dir, id)
    }

    async fn runner(&self, id: &TaskId) -> Option<Arc<TaskRunner>> {
        self.runners.read().await.get(id).cloned()
    }

    async fn runner_list(&self) -> Vec<(TaskId, Arc<TaskRunner>)> {
        self.runners
            .read()
            .await
            .iter()
            .map(|(id, runner)| (id.clone(), Arc::clone(runner)))
            .collect()
    }

    async fn publish(&self, event: TaskEvent) {
        self.events.publish(event).await;
    }

    async fn publish_snapshot(&self) {
        let active = self.active_runners().await;
        let snapshot = {
            let control = self.control.lock();
            SchedulerSnapshot {
                state: control.state.clone(),
                active_runners: active,
                frozen_tasks: control.frozen_tasks.iter().cloned().collect(),
                alignment: control.alignment.clone(),
                ticks: self.guard.entered(),
                skipped_ticks: self.guard.skipped(),
            }
        };
        self.snapshot.send_replace(snapshot);
    }

    // ========================================================================
    // Task intake
    // ========================================================================

    /// Enqueue a task and wake the scheduler
    pub async fn enqueue(&self, spec: TaskSpec) -> Result<Task> {
        let task = self.store.enqueue(spec)?;
        self.publish(TaskEvent::task(
            task.id.as_str(),
            EventKind::Enqueued,
            format!("enqueued \"{}\"", task.title),
        ))
        .await;
        self.signal(Signal::TaskAdded {
            task_id: Some(task.id.clone()),
        });
        Ok(task)
    }

    /// Re-run a finished task with feedback; `None` if a runner is active or
    /// the task is not `completed`/`failed`
    pub async fn revise(&self, id: &TaskId, feedback: &str) -> Result<Option<Task>> {
        let runner_active = self.has_runner(id).await;
        let revised = self.store.revise_task(id, feedback, runner_active)?;
        if let Some(task) = &revised {
            self.publish(TaskEvent::task(
                id.as_str(),
                EventKind::Revised,
                format!("revision {}: {}", task.revision_count, feedback),
            ))
            .await;
            self.signal(Signal::TaskAdded {
                task_id: Some(id.clone()),
            });
        }
        Ok(revised)
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Queue a signal for the next tick
    pub fn signal(&self, signal: Signal) {
        if let Err(e) = self.signal_tx.send(signal) {
            warn!(signal = e.0.name(), "Signal dropped, scheduler queue closed");
        }
    }

    fn drain_signals(&self) -> Vec<Signal> {
        let mut signals = Vec::new();
        {
            let mut rx = self.signal_rx.lock();
            while let Ok(signal) = rx.try_recv() {
                signals.push(signal);
            }
        }
        match self.signal_files.drain() {
            Ok(from_files) => signals.extend(from_files),
            Err(e) => warn!(error = %e, "Failed to drain signal files"),
        }
        signals
    }

    async fn apply_signal(&self, signal: Signal) {
        debug!(signal = signal.name(), "Applying signal");
        match signal {
            Signal::Freeze {
                scope: SignalScope::Global,
                reason,
            } => self.freeze_all(reason).await,
            Signal::Freeze {
                scope: SignalScope::Task(id),
                ..
            } => self.freeze_task(&id).await,
            Signal::Resume {
                scope: SignalScope::Global,
            } => self.resume_all().await,
            Signal::Resume {
                scope: SignalScope::Task(id),
            } => self.resume_task(&id).await,
            Signal::Rest => self.rest().await,
            Signal::DayBoundary => {
                let cleared = {
                    let mut control = self.control.lock();
                    if control.state.is_resting() {
                        control.state = SchedulerState::Running;
                        true
                    } else {
                        false
                    }
                };
                if cleared {
                    info!("Day boundary, rest cleared");
                    self.publish(TaskEvent::global(
                        EventKind::System,
                        "day boundary: resting cleared",
                    ))
                    .await;
                }
            }
            Signal::TaskAdded { task_id } => {
                debug!(task_id = ?task_id, "Task added");
            }
            Signal::RequestAlignment { task_id, message } => {
                if let Err(e) = self.request_alignment(&task_id, &message).await {
                    warn!(task_id = %task_id, error = %e, "Alignment request failed");
                }
            }
        }
    }

    async fn freeze_all(&self, reason: Option<String>) {
        let newly_frozen = {
            let mut control = self.control.lock();
            if control.state.is_frozen() {
                false
            } else {
                control.state = SchedulerState::Frozen {
                    since: Utc::now(),
                    reason: reason.clone(),
                };
                true
            }
        };
        if !newly_frozen {
            return;
        }

        info!(reason = ?reason, "Scheduler frozen");
        for (id, runner) in self.runner_list().await {
            if runner.is_running() {
                if let Err(e) = runner.pause().await {
                    warn!(task_id = %id, error = %e, "Failed to pause runner");
                }
            }
        }
        let message = match reason {
            Some(reason) => format!("frozen: {}", reason),
            None => "frozen".to_string(),
        };
        self.publish(TaskEvent::global(EventKind::Frozen, message)).await;
    }

    async fn freeze_task(&self, id: &TaskId) {
        self.control.lock().frozen_tasks.insert(id.clone());
        if let Some(runner) = self.runner(id).await {
            if runner.is_running() {
                if let Err(e) = runner.pause().await {
                    warn!(task_id = %id, error = %e, "Failed to pause runner");
                }
            }
        }
        info!(task_id = %id, "Task frozen");
        self.publish(TaskEvent::task(id.as_str(), EventKind::Frozen, "frozen"))
            .await;
    }

    async fn resume_all(&self) {
        let (was_frozen, frozen_tasks) = {
            let mut control = self.control.lock();
            let was_frozen = control.state.is_frozen();
            if was_frozen {
                control.state = SchedulerState::Running;
            }
            (was_frozen, control.frozen_tasks.clone())
        };
        if !was_frozen {
            return;
        }

        info!("Scheduler resumed");
        for (id, runner) in self.runner_list().await {
            if frozen_tasks.contains(&id) {
                continue;
            }
            self.resume_runner(&id, &runner).await;
        }
        self.publish(TaskEvent::global(EventKind::Unfrozen, "resumed"))
            .await;
    }

    async fn resume_task(&self, id: &TaskId) {
        let (was_frozen, globally_frozen) = {
            let mut control = self.control.lock();
            (control.frozen_tasks.remove(id), control.state.is_frozen())
        };
        if !was_frozen {
            return;
        }
        if !globally_frozen {
            if let Some(runner) = self.runner(id).await {
                self.resume_runner(id, &runner).await;
            }
        }
        info!(task_id = %id, "Task unfrozen");
        self.publish(TaskEvent::task(id.as_str(), EventKind::Unfrozen, "resumed"))
            .await;
    }

    async fn resume_runner(&self, id: &TaskId, runner: &TaskRunner) {
        if !runner.is_paused() {
            return;
        }
        let task = match self.store.get(id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %id, "Cannot resume runner, task missing");
                return;
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Cannot resume runner");
                return;
            }
        };
        if let Err(e) = runner.resume(&task).await {
            warn!(task_id = %id, error = %e, "Failed to resume runner");
        }
    }

    async fn rest(&self) {
        {
            let mut control = self.control.lock();
            if control.state == SchedulerState::Running {
                control.state = SchedulerState::Resting { since: Utc::now() };
            }
        }

        info!("Rest requested, advising active runners");
        for (id, runner) in self.runner_list().await {
            if runner.is_finished() {
                continue;
            }
            if let Err(e) = runner.inject_message(REST_ADVISORY).await {
                warn!(task_id = %id, error = %e, "Failed to deliver rest advisory");
            }
        }
        self.publish(TaskEvent::global(EventKind::Resting, "rest requested"))
            .await;
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run one tick; `false` when suppressed because the previous one is
    /// still running
    pub async fn tick(&self) -> bool {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Previous tick still running, skipping");
            self.publish_snapshot().await;
            return false;
        };

        self.process_runner_events().await;

        for signal in self.drain_signals() {
            self.apply_signal(signal).await;
        }

        let frozen = self.control.lock().state.is_frozen();
        if frozen {
            debug!("Scheduler frozen, tick suppressed");
            self.publish_snapshot().await;
            return true;
        }

        if !self.recovered.swap(true, Ordering::AcqRel) {
            self.recover().await;
        }
        self.start_assigned().await;
        self.assign_pending();

        self.publish_snapshot().await;
        true
    }

    /// Re-create runners for tasks a previous process left running
    async fn recover(&self) {
        let mut orphans = Vec::new();
        for status in [TaskStatus::InProgress, TaskStatus::Paused] {
            match self.store.list_by_status(status) {
                Ok(tasks) => orphans.extend(tasks),
                Err(e) => warn!(error = %e, "Failed to scan for orphaned tasks"),
            }
        }

        for task in orphans {
            let resumable = self.sessions.exists(&task.id);
            let message = if resumable {
                info!(task_id = %task.id, "Recovering task from persisted session");
                "recovered after restart, resuming session"
            } else {
                info!(task_id = %task.id, "Recovering task without session, restarting");
                "recovered after restart, starting over"
            };
            let id = task.id.clone();
            if self.spawn_runner(task).await {
                self.publish(TaskEvent::task(id.as_str(), EventKind::System, message))
                    .await;
            }
        }
    }

    async fn start_assigned(&self) {
        let assigned = match self.store.list_by_status(TaskStatus::Assigned) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list assigned tasks");
                return;
            }
        };
        for task in assigned {
            let frozen = self.control.lock().frozen_tasks.contains(&task.id);
            if frozen {
                continue;
            }
            self.spawn_runner(task).await;
        }
    }

    /// Create, register and start a runner; `false` if one already exists or
    /// the start failed
    async fn spawn_runner(&self, task: Task) -> bool {
        let created = {
            let mut runners = self.runners.write().await;
            if runners.contains_key(&task.id) {
                return false;
            }
            let created = TaskRunner::new(
                &task,
                self.factory.as_ref(),
                Arc::clone(&self.store),
                &self.config.data_dir,
                self.runner_tx.clone(),
            )
            .map(Arc::new);
            if let Ok(runner) = &created {
                runners.insert(task.id.clone(), Arc::clone(runner));
            }
            created
        };

        let runner = match created {
            Ok(runner) => runner,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "No runtime adapter for task");
                if let Err(store_err) = self
                    .store
                    .record_failure(&task.id, format!("no runtime adapter: {}", e))
                {
                    warn!(task_id = %task.id, error = %store_err, "Failed to record failure");
                }
                self.publish(TaskEvent::task(
                    task.id.as_str(),
                    EventKind::Failed,
                    format!("no runtime adapter: {}", e),
                ))
                .await;
                return false;
            }
        };

        debug!(task_id = %task.id, adapter = runner.adapter_name(), "Starting runner");
        if let Err(e) = runner.start(&task).await {
            self.runners.write().await.remove(&task.id);
            self.publish(TaskEvent::task(
                task.id.as_str(),
                EventKind::Failed,
                format!("failed to start: {}", e),
            ))
            .await;
            return false;
        }
        true
    }

    /// Hand pending tasks to the collaborator without blocking the tick
    fn assign_pending(&self) {
        let pending = match self.store.list_by_status(TaskStatus::Pending) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list pending tasks");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        if self.assigning.swap(true, Ordering::AcqRel) {
            debug!("Assignment still in flight, skipping");
            return;
        }

        let job = AssignmentJob {
            store: Arc::clone(&self.store),
            assigner: Arc::clone(&self.assigner),
            events: Arc::clone(&self.events),
            retry: RetryConfig::from(&self.config.retry),
            in_flight: InFlightFlag(Arc::clone(&self.assigning)),
        };
        let view = AssignmentView {
            pending,
            executors: available_executors(&self.actors_dir()),
        };
        tokio::spawn(job.run(view));
    }

    // ========================================================================
    // Runner events
    // ========================================================================

    /// Handle runner events already received; skipped while `run` owns the channel
    pub async fn process_runner_events(&self) -> usize {
        let events = {
            let Ok(mut rx) = self.runner_rx.try_lock() else {
                return 0;
            };
            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            events
        };
        let count = events.len();
        for event in events {
            self.handle_runner_event(event).await;
        }
        count
    }

    pub async fn handle_runner_event(&self, event: RunnerEvent) {
        let id = &event.task_id;
        match &event.event {
            AdapterEvent::Started => {
                self.publish(TaskEvent::task(id.as_str(), EventKind::Started, "started"))
                    .await
            }
            AdapterEvent::Resumed => {
                self.publish(TaskEvent::task(id.as_str(), EventKind::Resumed, "resumed"))
                    .await
            }
            AdapterEvent::Paused => {
                self.publish(TaskEvent::task(id.as_str(), EventKind::Paused, "paused"))
                    .await
            }
            AdapterEvent::Checkpoint { session_id } => {
                debug!(task_id = %id, session_id = %session_id, "Session checkpoint");
            }
            AdapterEvent::Progress(snapshot) => self.on_progress(id, snapshot).await,
            AdapterEvent::Completed { summary } => {
                let message = if summary.is_empty() {
                    "completed".to_string()
                } else {
                    format!("completed: {}", summary)
                };
                self.publish(TaskEvent::task(id.as_str(), EventKind::Completed, message))
                    .await
            }
            AdapterEvent::Failed {
                reason,
                diagnostics,
            } => {
                if let Some(diagnostics) = diagnostics {
                    warn!(task_id = %id, diagnostics = %diagnostics, "Task diagnostics");
                }
                self.publish(TaskEvent::task(
                    id.as_str(),
                    EventKind::Failed,
                    format!("failed: {}", reason),
                ))
                .await
            }
        }

        if event.is_terminal() {
            self.evict(id).await;
            self.leave_alignment(id, "task finished").await;
            self.publish_snapshot().await;
        }
    }

    async fn on_progress(&self, id: &TaskId, snapshot: &ProgressSnapshot) {
        if let Some(question) = snapshot.pending_question() {
            let entered = {
                let mut control = self.control.lock();
                let current = control
                    .alignment
                    .as_ref()
                    .map(|session| session.task_id.clone());
                match current {
                    Some(current) if &current == id => false,
                    Some(_) => {
                        if !control.waiting.iter().any(|(waiting, _)| waiting == id) {
                            control.waiting.push_back((id.clone(), question.to_string()));
                        }
                        false
                    }
                    None => {
                        control.alignment = Some(AlignmentSession {
                            task_id: id.clone(),
                            question: question.to_string(),
                            started_at: Utc::now(),
                        });
                        true
                    }
                }
            };

            self.publish(TaskEvent::task(id.as_str(), EventKind::Question, question))
                .await;
            if entered {
                info!(task_id = %id, "Entering alignment");
                self.publish(TaskEvent::task(
                    id.as_str(),
                    EventKind::AlignmentStarted,
                    "alignment started; operator input now goes to this task",
                ))
                .await;
            }
            self.publish_snapshot().await;
            return;
        }

        self.leave_alignment(id, "task continued on its own").await;
        self.publish(TaskEvent::task(
            id.as_str(),
            EventKind::Progress,
            format!(
                "{} ({:.0}%): {}",
                snapshot.status, snapshot.percent_complete, snapshot.summary
            ),
        ))
        .await;
    }

    /// Auto-exit alignment (or the waiting queue) for `id`
    async fn leave_alignment(&self, id: &TaskId, why: &str) {
        let exited = {
            let mut control = self.control.lock();
            control.waiting.retain(|(waiting, _)| waiting != id);
            let aligned = matches!(&control.alignment, Some(session) if &session.task_id == id);
            if aligned {
                control.alignment = None;
            }
            aligned
        };
        if exited {
            info!(task_id = %id, reason = why, "Leaving alignment");
            self.publish(TaskEvent::task(id.as_str(), EventKind::AlignmentEnded, why))
                .await;
            self.promote_waiting().await;
            self.publish_snapshot().await;
        }
    }

    /// Open alignment with the next task still waiting for a human
    async fn promote_waiting(&self) {
        loop {
            let next = {
                let mut control = self.control.lock();
                if control.alignment.is_some() {
                    return;
                }
                control.waiting.pop_front()
            };
            let Some((id, question)) = next else {
                return;
            };
            if !self.has_runner(&id).await {
                continue;
            }
            let entered = {
                let mut control = self.control.lock();
                if control.alignment.is_some() {
                    control.waiting.push_front((id.clone(), question.clone()));
                    false
                } else {
                    control.alignment = Some(AlignmentSession {
                        task_id: id.clone(),
                        question,
                        started_at: Utc::now(),
                    });
                    true
                }
            };
            if entered {
                info!(task_id = %id, "Entering alignment");
                self.publish(TaskEvent::task(
                    id.as_str(),
                    EventKind::AlignmentStarted,
                    "alignment started; operator input now goes to this task",
                ))
                .await;
            }
            return;
        }
    }

    async fn evict(&self, id: &TaskId) {
        let runner = self.runners.write().await.remove(id);
        self.control.lock().frozen_tasks.remove(id);
        if let Some(runner) = runner {
            debug!(task_id = %id, "Evicting finished runner");
            if let Err(e) = runner.release().await {
                warn!(task_id = %id, error = %e, "Failed to release runner");
            }
        }
    }

    // ========================================================================
    // Alignment / operator input
    // ========================================================================

    /// Soft alignment request: inbox advisory plus the pause signal file
    pub async fn request_alignment(&self, id: &TaskId, message: &str) -> Result<()> {
        if self.store.get(id)?.is_none() {
            return Err(Error::NotFound(format!("task {}", id)));
        }
        let files = self.files(id);
        files.ensure_dir()?;
        self.deliver(id, &alignment_advisory(message)).await?;
        files.write_pause_signal(message)?;

        info!(task_id = %id, "Alignment requested");
        self.publish(TaskEvent::task(
            id.as_str(),
            EventKind::System,
            format!("alignment requested: {}", message),
        ))
        .await;
        Ok(())
    }

    /// End the alignment session, authorizing independent judgment
    pub async fn end_alignment(&self) -> Result<Option<TaskId>> {
        let session = self.control.lock().alignment.take();
        let Some(session) = session else {
            return Ok(None);
        };
        let id = session.task_id;

        self.deliver(&id, INDEPENDENT_JUDGMENT).await?;
        if let Err(e) = self.files(&id).clear_pause_signal() {
            warn!(task_id = %id, error = %e, "Failed to clear pause signal");
        }

        info!(task_id = %id, "Alignment ended by operator");
        self.publish(TaskEvent::task(
            id.as_str(),
            EventKind::AlignmentEnded,
            "ended by operator; independent judgment authorized",
        ))
        .await;
        self.promote_waiting().await;
        self.publish_snapshot().await;
        Ok(Some(id))
    }

    /// Route free-form operator text
    pub async fn operator_input(&self, scope: InputScope, text: &str) -> Result<InputRoute> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput("empty operator input".into()));
        }

        let aligned = self
            .control
            .lock()
            .alignment
            .as_ref()
            .map(|session| session.task_id.clone());
        if let Some(id) = aligned {
            if text == END_ALIGNMENT_COMMAND {
                self.end_alignment().await?;
                return Ok(InputRoute::AlignmentEnded(id));
            }
            self.deliver(&id, text).await?;
            debug!(task_id = %id, "Operator input routed to alignment");
            return Ok(InputRoute::Alignment(id));
        }

        match scope {
            InputScope::Task(id) => {
                if self.store.get(&id)?.is_none() {
                    return Err(Error::NotFound(format!("task {}", id)));
                }
                self.deliver(&id, text).await?;
                Ok(InputRoute::TaskInbox(id))
            }
            InputScope::Global => {
                if let Some(signal) = parse_command(text) {
                    self.signal(signal.clone());
                    return Ok(InputRoute::Signal(signal));
                }
                let task = self
                    .enqueue(TaskSpec::new(title_from_text(text), text).created_by(CreatedBy::Human))
                    .await?;
                Ok(InputRoute::NewTask(task.id))
            }
        }
    }

    /// Inbox delivery through the runner when one exists
    async fn deliver(&self, id: &TaskId, text: &str) -> Result<()> {
        match self.runner(id).await {
            Some(runner) => runner.inject_message(text).await,
            None => self.files(id).push_inbox(text),
        }
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Tick every `tickIntervalMs` and handle runner events until `shutdown`
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            data_dir = %self.config.data_dir.display(),
            tick_ms = self.config.tick_interval_ms,
            "Scheduler loop started"
        );

        let mut runner_rx = self.runner_rx.lock().await;
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.tick().await;
                    });
                }
                Some(event) = runner_rx.recv() => self.handle_runner_event(event).await,
            }
        }
        drop(runner_rx);

        self.shutdown().await;
    }

    /// Release every runner; tasks stay resumable for the next start
    pub async fn shutdown(&self) {
        let runners: Vec<(TaskId, Arc<TaskRunner>)> =
            self.runners.write().await.drain().collect();
        for (id, runner) in runners {
            if let Err(e) = runner.release().await {
                warn!(task_id = %id, error = %e, "Failed to release runner");
            }
        }
        self.publish_snapshot().await;
        info!("Scheduler loop stopped");
    }
}

#[async_trait]
impl TaskSink for Engine {
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId> {
        Engine::enqueue(self, spec).await.map(|task| task.id)
    }
}

// ============================================================================
// Assignment job
// ============================================================================

/// Clears the in-flight flag however the job ends
struct InFlightFlag(Arc<AtomicBool>);

impl Drop for InFlightFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct AssignmentJob {
    store: Arc<TaskStore>,
    assigner: Arc<dyn AssignmentCollaborator>,
    events: Arc<EventBus>,
    retry: RetryConfig,
    in_flight: InFlightFlag,
}

impl AssignmentJob {
    async fn run(self, view: AssignmentView) {
        let count = view.pending.len();
        debug!(collaborator = self.assigner.name(), pending = count, "Requesting assignments");

        let result = with_retry(&self.retry, "assignment", || {
            let assigner = Arc::clone(&self.assigner);
            let view = view.clone();
            async move { assigner.assign(view).await }
        })
        .await;

        match result {
            Ok(decisions) => {
                for decision in decisions {
                    match self.store.assign(&decision.task_id, decision.assignment) {
                        Ok(task) => {
                            let assignees = task.assignees().join(", ");
                            info!(task_id = %task.id, assignees = %assignees, "Task assigned");
                            self.events
                                .publish(TaskEvent::task(
                                    task.id.as_str(),
                                    EventKind::Assigned,
                                    format!("assigned to {}", assignees),
                                ))
                                .await;
                        }
                        Err(e) => {
                            warn!(task_id = %decision.task_id, error = %e, "Assignment rejected")
                        }
                    }
                }
            }
            Err(e) => {
                warn!(collaborator = self.assigner.name(), error = %e, "Assignment failed");
                self.events
                    .publish(TaskEvent::global(
                        EventKind::System,
                        format!("assignment failed, retrying next tick: {}", e),
                    ))
                    .await;
            }
        }
        drop(self.in_flight);
    }
}
