//! One-shot operator commands
//!
//! These talk to the data directory directly. A running daemon picks the
//! changes up on its next tick: tasks through `tasks.json`, signals through
//! `signals/*.json`.

use crate::{CronCommand, SignalCommand, TaskCommand};
use anyhow::{bail, Context};
use chrono::{DateTime, TimeZone, Utc};
use hive_cron::{CronJob, CronPayload, CronSchedule, CronScheduler, NewCronJob};
use hive_engine::{Signal, SignalFiles};
use hive_foundation::HiveConfig;
use hive_task::{CreatedBy, Priority, Task, TaskFiles, TaskId, TaskSpec, TaskStatus, TaskStore};
use std::sync::Arc;

// ============================================================================
// Tasks
// ============================================================================

pub fn task(config: &HiveConfig, command: TaskCommand) -> anyhow::Result<()> {
    let store = TaskStore::open(&config.data_dir);

    match command {
        TaskCommand::Add {
            title,
            description,
            priority,
            thread,
            plan_approval,
        } => {
            let priority: Priority = priority.parse()?;
            let mut spec = TaskSpec::new(title, description)
                .with_priority(priority)
                .created_by(CreatedBy::Human);
            spec.requires_plan_approval = plan_approval;
            if let Some(thread) = thread {
                spec = spec.with_thread_ref(thread);
            }
            let task = store.enqueue(spec)?;
            println!("{}", task.id);
        }
        TaskCommand::List { status, json } => {
            let tasks = match status {
                Some(status) => store.list_by_status(status.parse::<TaskStatus>()?)?,
                None => store.list()?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(());
            }
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &tasks {
                println!("{}", describe_task(task));
            }
        }
        TaskCommand::Revise { id, feedback } => {
            let id = TaskId::from(id.as_str());
            // a live daemon checks its runner registry; from here only the
            // persisted status can tell
            let active = store
                .get(&id)?
                .map(|task| !task.status.is_terminal())
                .unwrap_or(false);
            match store.revise_task(&id, feedback, active)? {
                Some(task) => println!("{} revision {}", task.id, task.revision_count),
                None => bail!("task {} is still active; revise it after it finishes", id),
            }
        }
        TaskCommand::Message { id, text } => {
            let id = TaskId::from(id.as_str());
            if store.get(&id)?.is_none() {
                bail!("unknown task {}", id);
            }
            TaskFiles::new(&config.data_dir, &id).push_inbox(text)?;
            println!("queued for {}", id);
        }
    }
    Ok(())
}

fn describe_task(task: &Task) -> String {
    let assignees = task.assignees().join(",");
    format!(
        "{} {}  {:<12} {:<8} {}{}",
        task.status.symbol(),
        task.id,
        task.status.as_str(),
        format!("{:?}", task.priority).to_lowercase(),
        task.title,
        if assignees.is_empty() {
            String::new()
        } else {
            format!("  [{}]", assignees)
        }
    )
}

// ============================================================================
// Cron
// ============================================================================

pub async fn cron(config: &HiveConfig, command: CronCommand) -> anyhow::Result<()> {
    let sink = Arc::new(TaskStore::open(&config.data_dir));
    let scheduler = CronScheduler::new(&config.data_dir, sink, config.cron.clone());

    match command {
        CronCommand::Add {
            name,
            at,
            every,
            cron,
            tz,
            task,
            description,
            script,
            keep,
            thread,
        } => {
            let schedule = match (at, every, cron) {
                (Some(at), _, _) => CronSchedule::at(parse_timestamp(&at)?.timestamp_millis()),
                (_, Some(every), _) => CronSchedule::every(parse_interval(&every)?),
                (_, _, Some(expr)) => CronSchedule::cron(expr, tz),
                _ => bail!("one of --at, --every or --cron is required"),
            };
            let payload = match (task, script) {
                (Some(title), _) => CronPayload::task(title, description),
                (_, Some(command)) => CronPayload::script(command),
                _ => bail!("one of --task or --script is required"),
            };

            let mut new = NewCronJob::new(name, schedule, payload);
            if keep {
                new = new.keep_after_run();
            }
            if let Some(thread) = thread {
                new = new.with_thread_ref(thread);
            }
            let job = scheduler.add(new)?;
            println!("{}", job.id);
            if let Some(next) = job.state.next_run_at_ms {
                println!("next run {}", format_ms(next));
            }
        }
        CronCommand::List { json } => {
            let jobs = scheduler.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
                return Ok(());
            }
            if jobs.is_empty() {
                println!("No cron jobs.");
            }
            for job in &jobs {
                println!("{}", describe_job(job));
            }
        }
        CronCommand::Remove { id } => {
            if !scheduler.remove(&id)? {
                bail!("unknown cron job {}", id);
            }
            println!("removed {}", id);
        }
        CronCommand::Enable { id } => {
            let job = scheduler.set_enabled(&id, true)?;
            println!("{}", describe_job(&job));
        }
        CronCommand::Disable { id } => {
            let job = scheduler.set_enabled(&id, false)?;
            println!("{}", describe_job(&job));
        }
        CronCommand::Run { id } => {
            let record = scheduler
                .run_now(&id)
                .await
                .with_context(|| format!("running cron job {}", id))?;
            println!("{}", record.status);
            if let Some(task_id) = record.task_id {
                println!("task {}", task_id);
            }
            if !record.output.is_empty() {
                println!("{}", record.output);
            }
        }
        CronCommand::Runs { id, limit } => {
            for record in scheduler.runs(&id, Some(limit))? {
                println!(
                    "{}  {:<5} {}ms{}",
                    format_ms(record.started_at_ms),
                    record.status.to_string(),
                    record.finished_at_ms - record.started_at_ms,
                    record
                        .task_id
                        .map(|id| format!("  task {}", id))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn describe_job(job: &CronJob) -> String {
    let next = job
        .state
        .next_run_at_ms
        .map(format_ms)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<8} {:<6} {:<24} next {}  runs {}  {}",
        job.id,
        if job.enabled { "enabled" } else { "disabled" },
        job.runtime.to_string(),
        job.schedule.to_string(),
        next,
        job.state.run_count,
        job.name
    )
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let at = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp {:?}, expected RFC 3339", value))?;
    Ok(at.with_timezone(&Utc))
}

/// `90s`, `15m`, `2h`, `1d`; a bare number is seconds
fn parse_interval(value: &str) -> anyhow::Result<i64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);
    let amount: i64 = amount
        .parse()
        .with_context(|| format!("invalid interval {:?}", value))?;
    let unit_ms = match unit {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => bail!("unknown interval unit {:?}", other),
    };
    if amount <= 0 {
        bail!("interval must be positive");
    }
    Ok(amount * unit_ms)
}

// ============================================================================
// Signals
// ============================================================================

pub fn signal(config: &HiveConfig, command: SignalCommand) -> anyhow::Result<()> {
    let signal = match command {
        SignalCommand::Freeze { task: Some(id), .. } => {
            Signal::freeze_task(TaskId::from(id.as_str()))
        }
        SignalCommand::Freeze { task: None, reason } => Signal::freeze_all(reason),
        SignalCommand::Resume { task: Some(id) } => Signal::resume_task(TaskId::from(id.as_str())),
        SignalCommand::Resume { task: None } => Signal::resume_all(),
        SignalCommand::Rest => Signal::Rest,
        SignalCommand::Align { id, message } => Signal::RequestAlignment {
            task_id: TaskId::from(id.as_str()),
            message,
        },
    };
    SignalFiles::new(&config.data_dir).send(&signal)?;
    println!("{} signal queued", signal.name());
    Ok(())
}
