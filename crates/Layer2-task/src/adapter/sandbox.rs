//! Sandboxed adapter
//!
//! Runs a task inside a container that sees only an enumerated set of
//! mounts:
//!
//! | Host | Container | Mode |
//! |------|-----------|------|
//! | `<dataDir>/tasks/<taskId>` | `/hive/task` | rw |
//! | `<actorsDir>/<primary assignee>` | `/hive/actors/<assignee>` | rw |
//! | `<sharedDir>` | `/hive/shared` | ro |
//! | each `staticMounts` entry | as configured | ro |
//!
//! The task's session is created on first start and handed in as
//! `HIVE_SESSION_ID`; a `sessionId` reported in `progress.json` replaces it.
//!
//! Completion requires exit code 0 *and* a final `completed` progress
//! snapshot. After exit we wait up to `exitGraceMs` for a lagging final
//! snapshot before classifying the run.

use super::container::{ContainerRuntime, ContainerSpec, Mount};
use super::r#trait::{AdapterContext, AdapterEvent, AdapterState, RuntimeAdapter};
use crate::sync::{ProgressSnapshot, ProgressStatus, ProgressWatcher};
use crate::task::{Task, TaskId};
use async_trait::async_trait;
use hive_foundation::{Error, Result, SandboxSettings};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CONTAINER_TASK_DIR: &str = "/hive/task";
pub const CONTAINER_ACTORS_DIR: &str = "/hive/actors";
pub const CONTAINER_SHARED_DIR: &str = "/hive/shared";

/// Data dir subdirectories used when the settings leave them unset
const DEFAULT_ACTORS_DIR: &str = "actors";
const DEFAULT_SHARED_DIR: &str = "shared";

/// Diagnostics attached to failure events are capped to this many bytes
const MAX_DIAGNOSTICS: usize = 16 * 1024;

// ============================================================================
// Launcher
// ============================================================================

/// Builds and launches containers for one task
#[derive(Clone)]
struct Launcher {
    ctx: AdapterContext,
    runtime: Arc<dyn ContainerRuntime>,
    settings: SandboxSettings,
    data_dir: PathBuf,
}

impl Launcher {
    fn actors_dir(&self) -> PathBuf {
        self.settings
            .actors_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_ACTORS_DIR))
    }

    fn shared_dir(&self) -> PathBuf {
        self.settings
            .shared_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_SHARED_DIR))
    }

    /// The complete mount set; nothing else from the host is visible
    fn mount_plan(&self, task: &Task) -> Result<Vec<Mount>> {
        let mut mounts = vec![Mount::read_write(self.ctx.files.dir(), CONTAINER_TASK_DIR)];

        if let Some(actor) = task.primary_assignee() {
            validate_actor_name(actor)?;
            mounts.push(Mount::read_write(
                self.actors_dir().join(actor),
                Path::new(CONTAINER_ACTORS_DIR).join(actor),
            ));
        }

        mounts.push(Mount::read_only(self.shared_dir(), CONTAINER_SHARED_DIR));

        for (host, target) in &self.settings.static_mounts {
            if !host.exists() {
                return Err(Error::Config(format!(
                    "static mount source {} does not exist",
                    host.display()
                )));
            }
            mounts.push(Mount::read_only(host, target));
        }
        Ok(mounts)
    }

    /// Create host-side directories up front so the daemon never creates them as root
    fn prepare_host_dirs(&self, mounts: &[Mount]) -> Result<()> {
        for mount in mounts.iter().filter(|m| !self.settings.static_mounts.contains_key(&m.host)) {
            std::fs::create_dir_all(&mount.host).map_err(|e| {
                Error::Storage(format!("Failed to create {}: {}", mount.host.display(), e))
            })?;
        }
        Ok(())
    }

    fn container_env(&self, task: &Task, tool_augmentation: bool) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        env.insert("TASK_ID".to_string(), task.id.to_string());
        env.insert("TASK_TITLE".to_string(), task.title.clone());
        env.insert("TASK_DESCRIPTION".to_string(), task.description.clone());
        env.insert("HIVE_TASK_DIR".to_string(), CONTAINER_TASK_DIR.to_string());
        if let Some(actor) = task.primary_assignee() {
            env.insert("HIVE_ACTOR".to_string(), actor.to_string());
        }
        if let Some(note) = &task.revision_note {
            env.insert("HIVE_REVISION_NOTE".to_string(), note.clone());
        }
        if let Some(session_id) = self.ctx.sessions.get(&task.id)? {
            env.insert("HIVE_SESSION_ID".to_string(), session_id);
        }
        for name in &self.settings.credential_env {
            match std::env::var(name) {
                Ok(value) => {
                    env.insert(name.clone(), value);
                }
                Err(_) => debug!(task_id = %task.id, variable = %name, "Credential not set on host"),
            }
        }
        if !self.settings.tool_augmentation_env.is_empty() {
            env.insert(
                self.settings.tool_augmentation_env.clone(),
                if tool_augmentation { "1" } else { "0" }.to_string(),
            );
        }
        Ok(env)
    }

    fn spec(&self, task: &Task, tool_augmentation: bool) -> Result<ContainerSpec> {
        let mounts = self.mount_plan(task)?;
        self.prepare_host_dirs(&mounts)?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let mut labels = BTreeMap::new();
        labels.insert("hive.task-id".to_string(), task.id.to_string());

        Ok(ContainerSpec {
            name: format!("hive-{}-{}", task.id, &suffix[..8]),
            image: self.settings.image.clone(),
            command: self.settings.command.clone(),
            env: self.container_env(task, tool_augmentation)?,
            mounts,
            network: self.settings.network.clone(),
            labels,
        })
    }

    /// Launch detached and record the handle on the task
    async fn launch(&self, task: &Task, tool_augmentation: bool) -> Result<String> {
        let spec = self.spec(task, tool_augmentation)?;
        let id = self.runtime.create_and_start(&spec).await?;
        self.ctx.store.set_sandbox_handle(&task.id, Some(id.clone()))?;
        info!(task_id = %task.id, container = %id, tool_augmentation, "Sandbox launched");
        Ok(id)
    }

    /// Best-effort container removal
    async fn remove(&self, id: &str) {
        if let Err(e) = self.runtime.remove(id).await {
            warn!(task_id = %self.ctx.task_id, container = %id, error = %e, "Failed to remove container");
        }
    }
}

/// Session id for a container that has not reported its own yet
fn new_session_id(task_id: &TaskId) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("sbx-{}-{}", task_id, &suffix[..12])
}

fn validate_actor_name(actor: &str) -> Result<()> {
    let valid = !actor.is_empty()
        && actor != "."
        && actor != ".."
        && !actor.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid actor name: {:?}", actor)))
    }
}

fn cap(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut start = text.len() - max;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        text = format!("...{}", &text[start..]);
    }
    text
}

// ============================================================================
// SandboxAdapter
// ============================================================================

#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Adapter running each task in its own container
pub struct SandboxAdapter {
    launcher: Launcher,
    state: Arc<Mutex<AdapterState>>,
    container: Arc<Mutex<Option<String>>>,
    control: Mutex<Control>,
}

impl SandboxAdapter {
    pub fn new(
        ctx: AdapterContext,
        runtime: Arc<dyn ContainerRuntime>,
        settings: SandboxSettings,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher: Launcher {
                ctx,
                runtime,
                settings,
                data_dir: data_dir.into(),
            },
            state: Arc::new(Mutex::new(AdapterState::Idle)),
            container: Arc::new(Mutex::new(None)),
            control: Mutex::new(Control::default()),
        }
    }

    /// Current container id
    pub fn container_id(&self) -> Option<String> {
        self.container.lock().clone()
    }

    /// Drop a finished snapshot left by an earlier run of the same task
    fn clear_stale_progress(&self) {
        let files = &self.launcher.ctx.files;
        if let Some(snapshot) = files.read_progress() {
            if snapshot.status.is_terminal() {
                debug!(task_id = %files.task_id(), status = %snapshot.status, "Clearing stale progress snapshot");
                if let Err(e) = std::fs::remove_file(files.progress_path()) {
                    warn!(task_id = %files.task_id(), error = %e, "Failed to clear stale progress");
                }
            }
        }
    }
}

#[async_trait]
impl RuntimeAdapter for SandboxAdapter {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    async fn start(&self, task: &Task) -> Result<()> {
        let state = self.state();
        if state != AdapterState::Idle {
            return Err(Error::Adapter(format!(
                "sandbox adapter for {} already started ({})",
                task.id, state
            )));
        }

        let ctx = &self.launcher.ctx;
        ctx.files.ensure_dir()?;
        ctx.files.clear_pause_signal()?;
        self.clear_stale_progress();

        // A container from a previous control-plane process cannot be re-attached
        if let Some(stale) = &task.sandbox_handle {
            debug!(task_id = %task.id, container = %stale, "Removing container from previous run");
            self.launcher.remove(stale).await;
        }

        let (session_id, created) = match ctx.sessions.get(&task.id)? {
            Some(existing) => (existing, false),
            None => {
                let fresh = new_session_id(&task.id);
                ctx.sessions.save(&task.id, &fresh)?;
                (fresh, true)
            }
        };

        let tool_augmentation = self.launcher.settings.tool_augmentation;
        let id = self.launcher.launch(task, tool_augmentation).await?;
        *self.container.lock() = Some(id.clone());
        *self.state.lock() = AdapterState::Running;
        ctx.emit(AdapterEvent::Started);
        if created {
            ctx.emit(AdapterEvent::Checkpoint {
                session_id: session_id.clone(),
            });
        }

        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            task: task.clone(),
            launcher: self.launcher.clone(),
            state: Arc::clone(&self.state),
            container: Arc::clone(&self.container),
            cancel: cancel.clone(),
            tool_augmentation,
            session_id: Mutex::new(session_id),
        };
        let handle = tokio::spawn(supervisor.run(id));

        let mut control = self.control.lock();
        control.cancel = Some(cancel);
        control.handle = Some(handle);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        if self.state() != AdapterState::Running {
            return Ok(());
        }
        let Some(id) = self.container_id() else {
            return Ok(());
        };
        self.launcher.runtime.pause(&id).await?;
        *self.state.lock() = AdapterState::Paused;
        info!(task_id = %self.launcher.ctx.task_id, container = %id, "Sandbox paused");
        self.launcher.ctx.emit(AdapterEvent::Paused);
        Ok(())
    }

    async fn resume(&self, _task: &Task) -> Result<()> {
        if self.state() != AdapterState::Paused {
            return Ok(());
        }
        let Some(id) = self.container_id() else {
            return Ok(());
        };
        self.launcher.ctx.files.clear_pause_signal()?;
        self.launcher.runtime.unpause(&id).await?;
        *self.state.lock() = AdapterState::Running;
        info!(task_id = %self.launcher.ctx.task_id, container = %id, "Sandbox resumed");
        self.launcher.ctx.emit(AdapterEvent::Resumed);
        Ok(())
    }

    async fn inject_message(&self, text: &str) -> Result<()> {
        self.launcher.ctx.files.push_inbox(text)
    }

    async fn release(&self) -> Result<()> {
        let (cancel, handle) = {
            let mut control = self.control.lock();
            (control.cancel.take(), control.handle.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(task_id = %self.launcher.ctx.task_id, error = %e, "Sandbox supervisor ended abnormally");
            }
        }
        let container = self.container.lock().take();
        if let Some(id) = container {
            self.launcher.remove(&id).await;
        }
        Ok(())
    }
}

impl Drop for SandboxAdapter {
    fn drop(&mut self) {
        if let Some(cancel) = self.control.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

enum Outcome {
    Completed(String),
    Failed {
        reason: String,
        diagnostics: Option<String>,
    },
    /// Empty output with tool augmentation on: run again without it
    Retry,
}

/// Watches one task's container until it exits
struct Supervisor {
    task: Task,
    launcher: Launcher,
    state: Arc<Mutex<AdapterState>>,
    container: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
    tool_augmentation: bool,
    session_id: Mutex<String>,
}

impl Supervisor {
    async fn run(mut self, first_container: String) {
        let files = self.launcher.ctx.files.clone();
        let poll = self.launcher.settings.progress_poll();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = ProgressWatcher::spawn(files, poll, tx);
        let mut container_id = first_container;
        let mut forwarded: Option<ProgressSnapshot> = None;

        loop {
            let exit = {
                let wait = self.launcher.runtime.wait(&container_id);
                tokio::pin!(wait);
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            watcher.stop().await;
                            return;
                        }
                        Some(snapshot) = rx.recv() => {
                            self.forward(&snapshot);
                            forwarded = Some(snapshot);
                        }
                        exit = &mut wait => break exit,
                    }
                }
            };

            let outcome = match exit {
                Ok(code) => self.classify(&container_id, code, &mut rx, &mut forwarded).await,
                Err(e) => Outcome::Failed {
                    reason: format!("lost track of container: {}", e),
                    diagnostics: None,
                },
            };

            self.launcher.remove(&container_id).await;
            *self.container.lock() = None;

            match outcome {
                Outcome::Retry => {
                    warn!(task_id = %self.task.id, "Empty output with tool augmentation, retrying without it");
                    self.tool_augmentation = false;
                    match self.launcher.launch(&self.task, false).await {
                        Ok(id) => {
                            *self.container.lock() = Some(id.clone());
                            container_id = id;
                            continue;
                        }
                        Err(e) => {
                            self.finish(Outcome::Failed {
                                reason: format!("relaunch without tool augmentation failed: {}", e),
                                diagnostics: None,
                            });
                            break;
                        }
                    }
                }
                outcome => {
                    self.finish(outcome);
                    break;
                }
            }
        }

        if let Err(e) = self
            .launcher
            .ctx
            .store
            .set_sandbox_handle(&self.task.id, None)
        {
            warn!(task_id = %self.task.id, error = %e, "Failed to clear sandbox handle");
        }
        watcher.stop().await;
    }

    fn forward(&self, snapshot: &ProgressSnapshot) {
        if let Some(reported) = snapshot.session_id.as_deref().filter(|id| !id.is_empty()) {
            self.checkpoint(reported);
        }
        if let Some(artifact) = &snapshot.artifact_ref {
            if let Err(e) = self
                .launcher
                .ctx
                .store
                .set_artifact_ref(&self.task.id, artifact.as_str())
            {
                warn!(task_id = %self.task.id, error = %e, "Failed to persist artifact ref");
            }
        }
        self.launcher
            .ctx
            .emit(AdapterEvent::Progress(snapshot.clone()));
    }

    /// Persist a session id the container reported, once per change
    fn checkpoint(&self, reported: &str) {
        {
            let mut current = self.session_id.lock();
            if current.as_str() == reported {
                return;
            }
            *current = reported.to_string();
        }
        let ctx = &self.launcher.ctx;
        if let Err(e) = ctx.sessions.save(&self.task.id, reported) {
            warn!(task_id = %self.task.id, error = %e, "Failed to persist session");
            return;
        }
        ctx.emit(AdapterEvent::Checkpoint {
            session_id: reported.to_string(),
        });
    }

    /// Wait out the grace period for a terminal snapshot
    async fn settle(
        &self,
        rx: &mut mpsc::UnboundedReceiver<ProgressSnapshot>,
        forwarded: &mut Option<ProgressSnapshot>,
    ) -> Option<ProgressSnapshot> {
        let settings = &self.launcher.settings;
        let deadline = Instant::now() + settings.exit_grace();
        loop {
            while let Ok(snapshot) = rx.try_recv() {
                self.forward(&snapshot);
                *forwarded = Some(snapshot);
            }
            let last = self
                .launcher
                .ctx
                .files
                .read_progress()
                .filter(|s| s.task_id == self.task.id.as_str());
            let settled = last.as_ref().map(|s| s.status.is_terminal()).unwrap_or(false);
            if settled || Instant::now() >= deadline {
                if let Some(snapshot) = &last {
                    if forwarded.as_ref() != Some(snapshot) {
                        self.forward(snapshot);
                        *forwarded = Some(snapshot.clone());
                    }
                }
                return last;
            }
            tokio::time::sleep(settings.progress_poll()).await;
        }
    }

    async fn classify(
        &self,
        container_id: &str,
        code: i64,
        rx: &mut mpsc::UnboundedReceiver<ProgressSnapshot>,
        forwarded: &mut Option<ProgressSnapshot>,
    ) -> Outcome {
        let last = self.settle(rx, forwarded).await;
        debug!(
            task_id = %self.task.id,
            exit_code = code,
            status = last.as_ref().map(|s| s.status.as_str()).unwrap_or("missing"),
            "Container exited"
        );

        if code == 0 {
            if let Some(snapshot) = &last {
                if snapshot.status == ProgressStatus::Completed {
                    return Outcome::Completed(snapshot.summary.clone());
                }
            }
        }

        let logs = match self.launcher.runtime.logs(container_id).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(task_id = %self.task.id, error = %e, "Failed to capture container logs");
                String::new()
            }
        };

        if code == 0 && self.tool_augmentation && logs.trim().is_empty() {
            return Outcome::Retry;
        }

        let reason = match (code, &last) {
            (0, None) => "container exited 0 without writing a progress snapshot".to_string(),
            (0, Some(snapshot)) => format!(
                "container exited 0 but last progress status was {}",
                snapshot.status
            ),
            (code, _) => format!("container exited with code {}", code),
        };
        Outcome::Failed {
            reason,
            diagnostics: if logs.is_empty() {
                None
            } else {
                Some(cap(logs, MAX_DIAGNOSTICS))
            },
        }
    }

    fn finish(&self, outcome: Outcome) {
        let ctx = &self.launcher.ctx;
        match outcome {
            Outcome::Completed(summary) => {
                *self.state.lock() = AdapterState::Completed;
                info!(task_id = %self.task.id, "Sandbox completed");
                ctx.emit(AdapterEvent::Completed { summary });
            }
            Outcome::Failed {
                reason,
                diagnostics,
            } => {
                *self.state.lock() = AdapterState::Failed;
                warn!(task_id = %self.task.id, reason = %reason, "Sandbox failed");
                ctx.emit(AdapterEvent::Failed {
                    reason,
                    diagnostics,
                });
            }
            Outcome::Retry => {}
        }
    }
}
