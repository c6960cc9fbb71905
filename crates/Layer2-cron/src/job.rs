//! Cron job model

use crate::schedule::CronSchedule;
use hive_foundation::{Error, Result};
use hive_task::{Priority, TaskId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// How a job's payload executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobRuntime {
    /// Short-lived script run by the scheduler; never touches the Task Store
    Inline,
    /// Enqueues a task
    #[default]
    Task,
}

impl std::fmt::Display for JobRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRuntime::Inline => write!(f, "inline"),
            JobRuntime::Task => write!(f, "task"),
        }
    }
}

/// What a job does when it fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CronPayload {
    #[serde(rename_all = "camelCase")]
    Script {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        /// Overrides `cron.scriptTimeoutMs`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    Task {
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        priority: Priority,
        #[serde(default)]
        requires_plan_approval: bool,
    },
}

impl CronPayload {
    pub fn script(command: impl Into<String>) -> Self {
        Self::Script {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            timeout_ms: None,
        }
    }

    pub fn task(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Task {
            title: title.into(),
            description: description.into(),
            priority: Priority::Normal,
            requires_plan_approval: false,
        }
    }

    /// Runtime implied by the payload
    pub fn runtime(&self) -> JobRuntime {
        match self {
            Self::Script { .. } => JobRuntime::Inline,
            Self::Task { .. } => JobRuntime::Task,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
}

impl RunStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RunStatus::Ok)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Error => write!(f, "error"),
        }
    }
}

/// Mutable run state of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CronJobState {
    pub last_run_at_ms: Option<i64>,
    pub next_run_at_ms: Option<i64>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub last_task_id: Option<TaskId>,
    /// Notification thread reused by every task this job creates
    pub linked_thread_ref: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A scheduled trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub runtime: JobRuntime,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    /// One-shot jobs only: delete after a successful fire
    #[serde(default = "default_true")]
    pub delete_after_run: bool,
    #[serde(default)]
    pub state: CronJobState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl CronJob {
    pub fn new_id() -> String {
        format!("job-{}", Uuid::new_v4().simple())
    }

    pub fn from_new(new: NewCronJob, now_ms: i64) -> Result<Self> {
        if new.name.trim().is_empty() {
            return Err(Error::InvalidInput("cron job name cannot be empty".into()));
        }
        new.schedule.validate()?;
        validate_payload(&new.payload)?;

        let mut job = Self {
            id: Self::new_id(),
            name: new.name,
            enabled: new.enabled,
            runtime: new.payload.runtime(),
            schedule: new.schedule,
            payload: new.payload,
            delete_after_run: new.delete_after_run,
            state: CronJobState {
                linked_thread_ref: new.linked_thread_ref,
                ..Default::default()
            },
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        job.refresh_next_run(now_ms);
        Ok(job)
    }

    /// Recompute `state.next_run_at_ms`
    pub fn refresh_next_run(&mut self, now_ms: i64) {
        self.state.next_run_at_ms = if self.enabled {
            self.schedule
                .next_run(now_ms, self.created_at_ms, self.state.last_run_at_ms)
        } else {
            None
        };
    }

    /// Whether the poll should fire this job now (`cron` jobs fire from timers)
    pub fn is_due(&self, now_ms: i64) -> bool {
        if !self.enabled || self.schedule.is_cron() {
            return false;
        }
        match self.state.next_run_at_ms {
            Some(next) => next <= now_ms && !self.already_fired_once(),
            None => false,
        }
    }

    /// A one-shot job that has already fired at or after its target
    pub fn already_fired_once(&self) -> bool {
        match (&self.schedule, self.state.last_run_at_ms) {
            (CronSchedule::At { at_ms }, Some(last)) => last >= *at_ms,
            _ => false,
        }
    }

    pub fn apply(&mut self, patch: CronJobPatch, now_ms: i64) -> Result<()> {
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(Error::InvalidInput("cron job name cannot be empty".into()));
            }
            self.name = name;
        }
        if let Some(schedule) = patch.schedule {
            schedule.validate()?;
            self.schedule = schedule;
        }
        if let Some(payload) = patch.payload {
            validate_payload(&payload)?;
            self.runtime = payload.runtime();
            self.payload = payload;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(delete_after_run) = patch.delete_after_run {
            self.delete_after_run = delete_after_run;
        }
        if let Some(thread_ref) = patch.linked_thread_ref {
            self.state.linked_thread_ref = Some(thread_ref);
        }
        self.updated_at_ms = now_ms;
        self.refresh_next_run(now_ms);
        Ok(())
    }
}

fn validate_payload(payload: &CronPayload) -> Result<()> {
    match payload {
        CronPayload::Script { command, .. } if command.trim().is_empty() => {
            Err(Error::InvalidInput("script command cannot be empty".into()))
        }
        CronPayload::Task { title, .. } if title.trim().is_empty() => {
            Err(Error::InvalidInput("task title cannot be empty".into()))
        }
        _ => Ok(()),
    }
}

/// Input to `CronScheduler::add`
#[derive(Debug, Clone)]
pub struct NewCronJob {
    pub name: String,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    pub enabled: bool,
    pub delete_after_run: bool,
    pub linked_thread_ref: Option<String>,
}

impl NewCronJob {
    pub fn new(name: impl Into<String>, schedule: CronSchedule, payload: CronPayload) -> Self {
        Self {
            name: name.into(),
            schedule,
            payload,
            enabled: true,
            delete_after_run: true,
            linked_thread_ref: None,
        }
    }

    pub fn keep_after_run(mut self) -> Self {
        self.delete_after_run = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_thread_ref(mut self, thread_ref: impl Into<String>) -> Self {
        self.linked_thread_ref = Some(thread_ref.into());
        self
    }
}

/// Partial update for `CronScheduler::update`
#[derive(Debug, Clone, Default)]
pub struct CronJobPatch {
    pub name: Option<String>,
    pub schedule: Option<CronSchedule>,
    pub payload: Option<CronPayload>,
    pub enabled: Option<bool>,
    pub delete_after_run: Option<bool>,
    pub linked_thread_ref: Option<String>,
}

/// One fire of a job, appended to its run history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRunRecord {
    pub job_id: String,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub status: RunStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_computes_next_run() {
        let job = CronJob::from_new(
            NewCronJob::new("tick", CronSchedule::every(10_000), CronPayload::script("true")),
            1_000,
        )
        .unwrap();
        assert_eq!(job.runtime, JobRuntime::Inline);
        assert_eq!(job.state.next_run_at_ms, Some(11_000));
        assert!(!job.is_due(10_999));
        assert!(job.is_due(11_000));
    }

    #[test]
    fn test_disabled_job_is_never_due() {
        let job = CronJob::from_new(
            NewCronJob::new("later", CronSchedule::at(5), CronPayload::task("t", "")).disabled(),
            1,
        )
        .unwrap();
        assert_eq!(job.state.next_run_at_ms, None);
        assert!(!job.is_due(100));
    }

    #[test]
    fn test_rejects_empty_fields() {
        assert!(CronJob::from_new(
            NewCronJob::new(" ", CronSchedule::every(1), CronPayload::script("true")),
            0
        )
        .is_err());
        assert!(CronJob::from_new(
            NewCronJob::new("x", CronSchedule::every(1), CronPayload::task("", "")),
            0
        )
        .is_err());
    }

    #[test]
    fn test_persisted_shape() {
        let job = CronJob::from_new(
            NewCronJob::new(
                "digest",
                CronSchedule::cron("0 8 * * *", None),
                CronPayload::task("Morning digest", ""),
            ),
            0,
        )
        .unwrap();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["runtime"], "task");
        assert_eq!(json["schedule"]["kind"], "cron");
        assert_eq!(json["payload"]["type"], "task");
        assert_eq!(json["deleteAfterRun"], true);
        assert!(json["state"]["nextRunAtMs"].is_number());

        let back: CronJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_patch_switches_runtime() {
        let mut job = CronJob::from_new(
            NewCronJob::new("x", CronSchedule::every(1_000), CronPayload::task("t", "")),
            0,
        )
        .unwrap();
        job.apply(
            CronJobPatch {
                payload: Some(CronPayload::script("echo hi")),
                enabled: Some(false),
                ..Default::default()
            },
            50,
        )
        .unwrap();
        assert_eq!(job.runtime, JobRuntime::Inline);
        assert_eq!(job.updated_at_ms, 50);
        assert_eq!(job.state.next_run_at_ms, None);
    }
}
