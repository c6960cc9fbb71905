//! Cron Scheduler
//!
//! Two periodic loops plus one timer per `cron` job:
//! - poll (`cron.pollIntervalMs`): fires due `at` and `every` jobs
//! - reconcile (`cron.reconcileIntervalMs`): re-syncs the registered `cron`
//!   timers with the job store, so additions, removals and enable/disable
//!   toggles are picked up without a restart
//!
//! Every fire persists `lastRunAtMs` and the next fire time before the payload
//! runs, so a one-shot job is never fired twice even if it is slow.

use crate::job::{
    CronJob, CronJobPatch, CronPayload, CronRunRecord, NewCronJob, RunStatus,
};
use crate::schedule::CronSchedule;
use crate::script::run_script;
use crate::sink::TaskSink;
use crate::store::CronStore;
use hive_foundation::{
    now_ms, CronSettings, Error, EventBus, EventKind, Result, TaskEvent, TickGuard,
};
use hive_task::{CreatedBy, TaskId, TaskSpec};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What caused a fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireTrigger {
    /// The poll found an `at`/`every` job due
    Poll,
    /// A registered `cron` timer elapsed
    Timer,
    /// `run_now`, regardless of schedule
    Manual,
}

struct CronTimer {
    fingerprint: String,
    cancel: CancellationToken,
}

/// Removes a job from the in-flight set when its fire ends
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

pub struct CronScheduler {
    store: CronStore,
    sink: Arc<dyn TaskSink>,
    settings: CronSettings,
    events: Option<Arc<EventBus>>,
    guard: TickGuard,
    /// Serializes read-modify-write of job records
    write_lock: Mutex<()>,
    in_flight: Mutex<HashSet<String>>,
    timers: Mutex<HashMap<String, CronTimer>>,
    changed: Notify,
}

impl CronScheduler {
    pub fn new(data_dir: impl AsRef<Path>, sink: Arc<dyn TaskSink>, settings: CronSettings) -> Self {
        Self {
            store: CronStore::open(data_dir, settings.history_limit),
            sink,
            settings,
            events: None,
            guard: TickGuard::new(),
            write_lock: Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
            timers: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    /// Publish fire notifications on `events`
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &CronStore {
        &self.store
    }

    pub fn tick_guard(&self) -> &TickGuard {
        &self.guard
    }

    // ========================================================================
    // Job management
    // ========================================================================

    pub fn add(&self, new: NewCronJob) -> Result<CronJob> {
        let job = CronJob::from_new(new, now_ms())?;
        {
            let _write = self.write_lock.lock();
            self.store.save(&job)?;
        }
        info!(job_id = %job.id, name = %job.name, schedule = %job.schedule, "Cron job added");
        self.changed.notify_one();
        Ok(job)
    }

    pub fn update(&self, id: &str, patch: CronJobPatch) -> Result<CronJob> {
        let job = {
            let _write = self.write_lock.lock();
            let mut job = self
                .store
                .get(id)?
                .ok_or_else(|| Error::NotFound(format!("cron job {}", id)))?;
            job.apply(patch, now_ms())?;
            self.store.save(&job)?;
            job
        };
        debug!(job_id = %id, enabled = job.enabled, "Cron job updated");
        self.changed.notify_one();
        Ok(job)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<CronJob> {
        self.update(
            id,
            CronJobPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    /// Delete a job and its history; returns whether it existed
    pub fn remove(&self, id: &str) -> Result<bool> {
        let existed = {
            let _write = self.write_lock.lock();
            self.store.remove(id)?
        };
        if let Some(timer) = self.timers.lock().remove(id) {
            timer.cancel.cancel();
        }
        if existed {
            info!(job_id = %id, "Cron job removed");
        }
        self.changed.notify_one();
        Ok(existed)
    }

    pub fn list(&self) -> Result<Vec<CronJob>> {
        self.store.list()
    }

    pub fn get(&self, id: &str) -> Result<Option<CronJob>> {
        self.store.get(id)
    }

    pub fn runs(&self, id: &str, limit: Option<usize>) -> Result<Vec<CronRunRecord>> {
        self.store.runs(id, limit)
    }

    /// Fire a job immediately, whatever its schedule
    pub async fn run_now(&self, id: &str) -> Result<CronRunRecord> {
        if self.store.get(id)?.is_none() {
            return Err(Error::NotFound(format!("cron job {}", id)));
        }
        self.fire(id, FireTrigger::Manual)
            .await?
            .ok_or_else(|| Error::Cron(format!("cron job {} is already running", id)))
    }

    // ========================================================================
    // Firing
    // ========================================================================

    /// One poll pass over `at`/`every` jobs; suppressed while the previous
    /// pass is still running
    pub async fn tick(&self) -> Vec<CronRunRecord> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Cron poll still running, skipping tick");
            return Vec::new();
        };

        let now = now_ms();
        let jobs = match self.store.list() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to list cron jobs");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for job in jobs.into_iter().filter(|job| job.is_due(now)) {
            match self.fire(&job.id, FireTrigger::Poll).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Cron job fire failed"),
            }
        }
        records
    }

    /// Fire one job; `None` when it was skipped (missing, not due, or in flight)
    pub async fn fire(&self, id: &str, trigger: FireTrigger) -> Result<Option<CronRunRecord>> {
        if !self.in_flight.lock().insert(id.to_string()) {
            debug!(job_id = %id, "Cron job already in flight");
            return Ok(None);
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            id: id.to_string(),
        };

        let started_at_ms = now_ms();
        let job = {
            let _write = self.write_lock.lock();
            let Some(mut job) = self.store.get(id)? else {
                return Ok(None);
            };
            let eligible = match trigger {
                FireTrigger::Poll => job.is_due(started_at_ms),
                FireTrigger::Timer => job.enabled && job.schedule.is_cron(),
                FireTrigger::Manual => true,
            };
            if !eligible {
                return Ok(None);
            }
            job.state.last_run_at_ms = Some(started_at_ms);
            job.state.run_count += 1;
            job.refresh_next_run(started_at_ms);
            self.store.save(&job)?;
            job
        };

        info!(job_id = %job.id, name = %job.name, trigger = ?trigger, "Firing cron job");
        let (status, output, task_id) = self.execute(&job).await;

        let record = CronRunRecord {
            job_id: job.id.clone(),
            started_at_ms,
            finished_at_ms: now_ms(),
            status,
            output,
            task_id,
        };
        self.finish(&record)?;
        self.notify(&job, &record).await;
        Ok(Some(record))
    }

    async fn execute(&self, job: &CronJob) -> (RunStatus, String, Option<TaskId>) {
        match &job.payload {
            CronPayload::Script {
                command,
                args,
                cwd,
                timeout_ms,
            } => {
                let limit = Duration::from_millis(
                    timeout_ms.unwrap_or(self.settings.script_timeout_ms).max(1),
                );
                match run_script(command, args, cwd.as_deref(), limit).await {
                    Ok(out) if out.success => (RunStatus::Ok, out.output, None),
                    Ok(out) => {
                        let output = if out.output.is_empty() {
                            match out.exit_code {
                                Some(code) => format!("exited with code {}", code),
                                None => "terminated by signal".to_string(),
                            }
                        } else {
                            out.output
                        };
                        (RunStatus::Error, output, None)
                    }
                    Err(e) => (RunStatus::Error, e.to_string(), None),
                }
            }
            CronPayload::Task {
                title,
                description,
                priority,
                requires_plan_approval,
            } => {
                let mut spec = TaskSpec::new(title.clone(), description.clone())
                    .with_priority(*priority)
                    .created_by(CreatedBy::Cron);
                spec.requires_plan_approval = *requires_plan_approval;
                if let Some(thread_ref) = &job.state.linked_thread_ref {
                    spec = spec.with_thread_ref(thread_ref.clone());
                }
                match self.sink.enqueue(spec).await {
                    Ok(task_id) => (
                        RunStatus::Ok,
                        format!("enqueued task {}", task_id),
                        Some(task_id),
                    ),
                    Err(e) => (RunStatus::Error, e.to_string(), None),
                }
            }
        }
    }

    /// Record the outcome; retire one-shot jobs
    fn finish(&self, record: &CronRunRecord) -> Result<()> {
        let _write = self.write_lock.lock();
        let Some(mut job) = self.store.get(&record.job_id)? else {
            // Removed while running
            return Ok(());
        };

        job.state.last_status = Some(record.status);
        job.state.last_error = match record.status {
            RunStatus::Ok => None,
            RunStatus::Error => Some(record.output.clone()),
        };
        if record.task_id.is_some() {
            job.state.last_task_id = record.task_id.clone();
        }

        if job.schedule.is_one_shot() && job.already_fired_once() {
            if record.status.is_ok() && job.delete_after_run {
                debug!(job_id = %job.id, "Deleting one-shot cron job");
                self.store.remove(&job.id)?;
                return Ok(());
            }
            job.enabled = false;
            job.state.next_run_at_ms = None;
        }

        self.store.save(&job)?;
        self.store.append_run(record)
    }

    async fn notify(&self, job: &CronJob, record: &CronRunRecord) {
        let first_line = record.output.lines().next().unwrap_or_default();
        match record.status {
            RunStatus::Ok => {
                info!(job_id = %job.id, task_id = ?record.task_id, "Cron job succeeded")
            }
            RunStatus::Error => {
                warn!(job_id = %job.id, output = %first_line, "Cron job failed")
            }
        }

        let Some(events) = &self.events else {
            return;
        };
        let (kind, message) = match record.status {
            RunStatus::Ok => (
                EventKind::CronFired,
                format!("cron job '{}' fired: {}", job.name, first_line),
            ),
            RunStatus::Error => (
                EventKind::CronFailed,
                format!("cron job '{}' failed: {}", job.name, first_line),
            ),
        };
        let event = match &record.task_id {
            Some(task_id) => TaskEvent::task(task_id.as_str(), kind, message),
            None => TaskEvent::global(kind, message),
        };
        events.publish(event).await;
    }

    // ========================================================================
    // Cron timers
    // ========================================================================

    /// Ids of jobs with a live `cron` timer
    pub fn registered_timers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.timers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register timers for enabled `cron` jobs and drop the rest
    pub fn reconcile(self: &Arc<Self>) -> Result<()> {
        let desired: HashMap<String, String> = self
            .store
            .list()?
            .into_iter()
            .filter(|job| job.enabled)
            .filter_map(|job| match &job.schedule {
                CronSchedule::Cron { expr, tz } => Some((
                    job.id.clone(),
                    format!("{}|{}", expr, tz.as_deref().unwrap_or("UTC")),
                )),
                _ => None,
            })
            .collect();

        let mut timers = self.timers.lock();
        timers.retain(|id, timer| {
            let keep = desired.get(id) == Some(&timer.fingerprint);
            if !keep {
                debug!(job_id = %id, "Unregistering cron timer");
                timer.cancel.cancel();
            }
            keep
        });

        for (id, fingerprint) in desired {
            if timers.contains_key(&id) {
                continue;
            }
            debug!(job_id = %id, "Registering cron timer");
            let cancel = CancellationToken::new();
            tokio::spawn(Arc::clone(self).run_timer(id.clone(), cancel.clone()));
            timers.insert(
                id,
                CronTimer {
                    fingerprint,
                    cancel,
                },
            );
        }
        Ok(())
    }

    async fn run_timer(self: Arc<Self>, id: String, cancel: CancellationToken) {
        let mut last_target: Option<i64> = None;
        loop {
            let job = match self.store.get(&id) {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Cron timer failed to load job");
                    break;
                }
            };

            let now = now_ms();
            let from = last_target.map_or(now, |target| target.max(now));
            let Some(next) = job
                .schedule
                .next_run(from, job.created_at_ms, job.state.last_run_at_ms)
            else {
                warn!(job_id = %id, "Cron expression has no future fire time");
                break;
            };

            let wait = Duration::from_millis((next - now).max(0) as u64);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            last_target = Some(next);

            if let Err(e) = self.fire(&id, FireTrigger::Timer).await {
                warn!(job_id = %id, error = %e, "Cron job fire failed");
            }
        }
        debug!(job_id = %id, "Cron timer stopped");
    }

    fn stop_timers(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.cancel.cancel();
        }
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Run the poll and reconcile loops until `shutdown`
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            poll_ms = self.settings.poll_interval_ms,
            reconcile_ms = self.settings.reconcile_interval_ms,
            "Cron scheduler started"
        );
        if let Err(e) = self.reconcile() {
            warn!(error = %e, "Initial cron reconcile failed");
        }

        let mut poll =
            tokio::time::interval(Duration::from_millis(self.settings.poll_interval_ms.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconcile = tokio::time::interval(Duration::from_millis(
            self.settings.reconcile_interval_ms.max(1),
        ));
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
        reconcile.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.tick().await;
                    });
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile() {
                        warn!(error = %e, "Cron reconcile failed");
                    }
                }
                _ = self.changed.notified() => {
                    if let Err(e) = self.reconcile() {
                        warn!(error = %e, "Cron reconcile failed");
                    }
                }
            }
        }

        self.stop_timers();
        info!("Cron scheduler stopped");
    }
}
