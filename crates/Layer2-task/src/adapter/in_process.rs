//! In-process adapter
//!
//! Drives the execution collaborator turn by turn inside the control-plane
//! process. The session handle is persisted after every turn, so `pause`
//! (which aborts the in-flight turn) loses at most that one turn and
//! `resume` continues from the last persisted session.

use super::collaborator::{ExecutionCollaborator, TurnRequest, TurnStatus};
use super::r#trait::{AdapterContext, AdapterEvent, AdapterState, RuntimeAdapter};
use super::tree::{ChildSupervisor, TreeLimits, ROOT_CONTEXT};
use crate::sync::{Checkpoint, ProgressSnapshot, ProgressStatus};
use crate::task::Task;
use async_trait::async_trait;
use hive_foundation::{with_retry, Error, Result, RetryConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Adapter running the collaborator within this process
pub struct InProcessAdapter {
    ctx: AdapterContext,
    collaborator: Arc<dyn ExecutionCollaborator>,
    limits: TreeLimits,
    retry: RetryConfig,
    inbox_poll: Duration,
    state: Arc<Mutex<AdapterState>>,
    control: Mutex<Control>,
}

impl InProcessAdapter {
    pub fn new(
        ctx: AdapterContext,
        collaborator: Arc<dyn ExecutionCollaborator>,
        limits: TreeLimits,
        retry: RetryConfig,
    ) -> Self {
        Self {
            ctx,
            collaborator,
            limits,
            retry,
            inbox_poll: Duration::from_millis(500),
            state: Arc::new(Mutex::new(AdapterState::Idle)),
            control: Mutex::new(Control::default()),
        }
    }

    /// How often a context waiting for input re-checks its inbox
    pub fn with_inbox_poll(mut self, interval: Duration) -> Self {
        self.inbox_poll = interval;
        self
    }

    fn launch(&self, task: &Task, announce: AdapterEvent) {
        let cancel = CancellationToken::new();
        *self.state.lock() = AdapterState::Running;
        self.ctx.emit(announce);

        let driver = RootDriver {
            task: task.clone(),
            ctx: self.ctx.clone(),
            collaborator: Arc::clone(&self.collaborator),
            limits: self.limits.clone(),
            retry: self.retry.clone(),
            inbox_poll: self.inbox_poll,
            cancel: cancel.clone(),
            state: Arc::clone(&self.state),
        };
        let handle = tokio::spawn(driver.run());

        let mut control = self.control.lock();
        control.cancel = Some(cancel);
        control.handle = Some(handle);
    }

    /// Abort the driver and wait for it to unwind
    async fn stop_driver(&self) {
        let (cancel, handle) = {
            let mut control = self.control.lock();
            (control.cancel.take(), control.handle.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(task_id = %self.ctx.task_id, error = %e, "In-process driver ended abnormally");
            }
        }
    }
}

#[async_trait]
impl RuntimeAdapter for InProcessAdapter {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    async fn start(&self, task: &Task) -> Result<()> {
        let state = self.state();
        if state != AdapterState::Idle {
            return Err(Error::Adapter(format!(
                "in-process adapter for {} already started ({})",
                task.id, state
            )));
        }
        info!(task_id = %task.id, collaborator = self.collaborator.name(), "Starting in-process execution");
        self.launch(task, AdapterEvent::Started);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        if self.state() != AdapterState::Running {
            return Ok(());
        }
        self.stop_driver().await;

        let paused = {
            let mut state = self.state.lock();
            if *state == AdapterState::Running {
                *state = AdapterState::Paused;
                true
            } else {
                false
            }
        };
        if paused {
            info!(task_id = %self.ctx.task_id, "In-process execution paused");
            self.ctx.emit(AdapterEvent::Paused);
        }
        Ok(())
    }

    async fn resume(&self, task: &Task) -> Result<()> {
        if self.state() != AdapterState::Paused {
            return Ok(());
        }
        info!(task_id = %task.id, "Resuming in-process execution");
        self.launch(task, AdapterEvent::Resumed);
        Ok(())
    }

    async fn inject_message(&self, text: &str) -> Result<()> {
        self.ctx.files.push_inbox(text)
    }

    async fn release(&self) -> Result<()> {
        self.stop_driver().await;
        debug!(task_id = %self.ctx.task_id, "In-process adapter released");
        Ok(())
    }
}

impl Drop for InProcessAdapter {
    fn drop(&mut self) {
        if let Some(cancel) = self.control.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Root driver
// ============================================================================

enum Terminal {
    Completed(String),
    Failed(String),
}

struct RootDriver {
    task: Task,
    ctx: AdapterContext,
    collaborator: Arc<dyn ExecutionCollaborator>,
    limits: TreeLimits,
    retry: RetryConfig,
    inbox_poll: Duration,
    cancel: CancellationToken,
    state: Arc<Mutex<AdapterState>>,
}

impl RootDriver {
    async fn run(self) {
        let terminal = match self.drive().await {
            Ok(Some(terminal)) => terminal,
            Ok(None) => return,
            Err(_) if self.cancel.is_cancelled() => return,
            Err(e) => Terminal::Failed(e.to_string()),
        };

        match terminal {
            Terminal::Completed(summary) => {
                *self.state.lock() = AdapterState::Completed;
                info!(task_id = %self.task.id, "In-process execution completed");
                self.ctx.emit(AdapterEvent::Completed { summary });
            }
            Terminal::Failed(reason) => {
                *self.state.lock() = AdapterState::Failed;
                warn!(task_id = %self.task.id, reason = %reason, "In-process execution failed");
                self.ctx.emit(AdapterEvent::Failed {
                    reason,
                    diagnostics: None,
                });
            }
        }
    }

    fn instructions(&self) -> String {
        match &self.task.revision_note {
            Some(note) => format!(
                "{}\n\nRevision {} requested: {}",
                self.task.description, self.task.revision_count, note
            ),
            None => self.task.description.clone(),
        }
    }

    /// `Ok(None)` means the run was aborted by a pause
    async fn drive(&self) -> Result<Option<Terminal>> {
        let files = &self.ctx.files;
        files.ensure_dir()?;

        let mut session_id = self.ctx.sessions.get(&self.task.id)?;
        let previous = files
            .read_progress()
            .filter(|s| s.task_id == self.task.id.as_str());
        let mut checkpoints = previous
            .as_ref()
            .map(|s| s.checkpoints.clone())
            .unwrap_or_default();
        let mut percent = previous.as_ref().map(|s| s.percent_complete).unwrap_or(0.0);
        let mut artifact_ref = previous.and_then(|s| s.artifact_ref);

        let mut children = ChildSupervisor::new(
            self.task.clone(),
            ROOT_CONTEXT,
            0,
            self.limits.clone(),
            Arc::clone(&self.collaborator),
            self.retry.clone(),
            &self.cancel,
        );
        let mut waiting_for_human = false;
        let mut awaiting_children = false;
        let mut turn = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if turn >= self.limits.max_turns {
                return Ok(Some(Terminal::Failed(format!(
                    "turn limit {} reached",
                    self.limits.max_turns
                ))));
            }

            let messages = files.drain_inbox()?;
            let mut child_reports = children.drain();
            awaiting_children = awaiting_children && children.outstanding() > 0;

            if messages.is_empty() && child_reports.is_empty() {
                if waiting_for_human || awaiting_children {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(None),
                        report = children.next(), if awaiting_children => {
                            child_reports.extend(report);
                        }
                        _ = tokio::time::sleep(self.inbox_poll) => {}
                    }
                    if child_reports.is_empty() {
                        continue;
                    }
                }
            }

            waiting_for_human = false;
            turn += 1;
            let delivered = messages.clone();
            let request = TurnRequest {
                task: self.task.clone(),
                context_id: ROOT_CONTEXT.to_string(),
                depth: 0,
                instructions: self.instructions(),
                session_id: session_id.clone(),
                turn,
                messages,
                child_reports,
            };

            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Undelivered input goes back for the next run
                    for message in delivered {
                        if let Err(e) = files.push_inbox(message) {
                            warn!(task_id = %self.task.id, error = %e, "Failed to re-queue inbox message");
                        }
                    }
                    return Ok(None);
                }
                result = with_retry(&self.retry, "execution turn", || {
                    let collaborator = Arc::clone(&self.collaborator);
                    let request = request.clone();
                    async move { collaborator.run_turn(request).await }
                }) => result,
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    return Ok(Some(Terminal::Failed(format!("collaborator error: {}", e))));
                }
            };

            if let Some(new_session) = outcome.session_id.clone() {
                if session_id.as_deref() != Some(new_session.as_str()) {
                    self.ctx.sessions.save(&self.task.id, &new_session)?;
                    self.ctx.emit(AdapterEvent::Checkpoint {
                        session_id: new_session.clone(),
                    });
                    session_id = Some(new_session);
                }
            }

            if !outcome.summary.is_empty() {
                checkpoints.push(Checkpoint::now(outcome.summary.clone()));
            }
            if let Some(p) = outcome.percent_complete {
                percent = p;
            }
            if outcome.status == TurnStatus::Completed && outcome.percent_complete.is_none() {
                percent = 100.0;
            }
            if outcome.artifact_ref.is_some() {
                artifact_ref = outcome.artifact_ref.clone();
            }

            let status = match outcome.status {
                TurnStatus::Continue => ProgressStatus::InProgress,
                TurnStatus::Completed => ProgressStatus::Completed,
                TurnStatus::Failed => ProgressStatus::Failed,
                TurnStatus::WaitingForHuman => ProgressStatus::WaitingForHuman,
            };
            let mut snapshot = ProgressSnapshot::new(self.task.id.as_str(), status)
                .with_summary(outcome.summary.clone())
                .with_percent(percent);
            snapshot.checkpoints = checkpoints.clone();
            snapshot.artifact_ref = artifact_ref.clone();
            if status == ProgressStatus::WaitingForHuman {
                snapshot.question = outcome.question.clone().or(Some(outcome.summary.clone()));
            }
            files.write_progress(&snapshot)?;
            if let Some(artifact) = &artifact_ref {
                if let Err(e) = self.ctx.store.set_artifact_ref(&self.task.id, artifact.as_str()) {
                    warn!(task_id = %self.task.id, error = %e, "Failed to persist artifact ref");
                }
            }
            self.ctx.emit(AdapterEvent::Progress(snapshot));

            for child in outcome.spawn {
                children.spawn(child);
            }

            match outcome.status {
                TurnStatus::Completed => return Ok(Some(Terminal::Completed(outcome.summary))),
                TurnStatus::Failed => {
                    let reason = if outcome.summary.is_empty() {
                        "execution reported failure".to_string()
                    } else {
                        outcome.summary
                    };
                    return Ok(Some(Terminal::Failed(reason)));
                }
                TurnStatus::WaitingForHuman => {
                    debug!(task_id = %self.task.id, "Waiting for operator input");
                    waiting_for_human = true;
                }
                TurnStatus::Continue => {
                    awaiting_children = children.outstanding() > 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::collaborator::TurnOutcome;
    use crate::session::SessionStore;
    use crate::store::TaskStore;
    use crate::sync::TaskFiles;
    use crate::task::TaskSpec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    /// Turn 1 checkpoints, turn 2 hangs until aborted, later turns complete
    struct ScriptedCollaborator {
        calls: AtomicU32,
        sessions_seen: Mutex<Vec<Option<String>>>,
        hang_on: u32,
    }

    impl ScriptedCollaborator {
        fn new(hang_on: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                sessions_seen: Mutex::new(Vec::new()),
                hang_on,
            }
        }
    }

    #[async_trait]
    impl ExecutionCollaborator for ScriptedCollaborator {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.sessions_seen.lock().push(request.session_id.clone());
            if call == 1 {
                return Ok(TurnOutcome::continuing("outlined").with_session("sess-1"));
            }
            if call == self.hang_on {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(TurnOutcome::completed("published"))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        task: Task,
        ctx: AdapterContext,
        events: mpsc::UnboundedReceiver<AdapterEvent>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()));
        let task = store
            .enqueue(TaskSpec::new("Draft announcement", "Write it"))
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = AdapterContext {
            task_id: task.id.clone(),
            store,
            sessions: SessionStore::open(dir.path()),
            files: TaskFiles::new(dir.path(), &task.id),
            events: tx,
        };
        Harness {
            _dir: dir,
            task,
            ctx,
            events: rx,
        }
    }

    fn limits() -> TreeLimits {
        TreeLimits {
            max_children: 2,
            max_depth: 1,
            max_turns: 20,
        }
    }

    async fn next_terminal(events: &mut mpsc::UnboundedReceiver<AdapterEvent>) -> AdapterEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(
                event,
                AdapterEvent::Completed { .. } | AdapterEvent::Failed { .. }
            ) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_runs_to_completion_and_persists_session() {
        let mut h = harness();
        let adapter = InProcessAdapter::new(
            h.ctx.clone(),
            Arc::new(ScriptedCollaborator::new(0)),
            limits(),
            RetryConfig::no_retry(),
        );
        adapter.start(&h.task).await.unwrap();
        assert!(adapter.start(&h.task).await.is_err());

        let terminal = next_terminal(&mut h.events).await;
        assert_eq!(
            terminal,
            AdapterEvent::Completed {
                summary: "published".into()
            }
        );
        assert_eq!(adapter.state(), AdapterState::Completed);
        assert_eq!(
            h.ctx.sessions.get(&h.task.id).unwrap().as_deref(),
            Some("sess-1")
        );

        let progress = h.ctx.files.read_progress().unwrap();
        assert_eq!(progress.status, ProgressStatus::Completed);
        assert_eq!(progress.checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_pause_aborts_turn_and_resume_keeps_session() {
        let mut h = harness();
        let collaborator = Arc::new(ScriptedCollaborator::new(2));
        let adapter = InProcessAdapter::new(
            h.ctx.clone(),
            collaborator.clone(),
            limits(),
            RetryConfig::no_retry(),
        );
        adapter.start(&h.task).await.unwrap();

        while collaborator.calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        adapter.pause().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Paused);
        adapter.pause().await.unwrap();

        adapter.resume(&h.task).await.unwrap();
        let terminal = next_terminal(&mut h.events).await;
        assert!(matches!(terminal, AdapterEvent::Completed { .. }));

        let seen = collaborator.sessions_seen.lock().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].as_deref(), Some("sess-1"));
    }

    /// Asks a question first, then completes with the operator's answer
    struct AskingCollaborator;

    #[async_trait]
    impl ExecutionCollaborator for AskingCollaborator {
        fn name(&self) -> &str {
            "asking"
        }

        async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
            match request.messages.first() {
                None => Ok(TurnOutcome::waiting("Use tone A or B?")),
                Some(answer) => Ok(TurnOutcome::completed(format!("used {}", answer))),
            }
        }
    }

    #[tokio::test]
    async fn test_waiting_for_human_resumes_on_inbox_message() {
        let mut h = harness();
        let adapter = InProcessAdapter::new(
            h.ctx.clone(),
            Arc::new(AskingCollaborator),
            limits(),
            RetryConfig::no_retry(),
        )
        .with_inbox_poll(Duration::from_millis(10));
        adapter.start(&h.task).await.unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
                .await
                .unwrap()
                .unwrap();
            if let AdapterEvent::Progress(snapshot) = event {
                assert_eq!(snapshot.pending_question(), Some("Use tone A or B?"));
                break;
            }
        }

        adapter.inject_message("tone B").await.unwrap();
        let terminal = next_terminal(&mut h.events).await;
        assert_eq!(
            terminal,
            AdapterEvent::Completed {
                summary: "used tone B".into()
            }
        );
    }
}
