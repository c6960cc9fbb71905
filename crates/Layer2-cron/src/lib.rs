//! # hive-cron
//!
//! Timed triggers for Hive. A job either enqueues a task or runs a short
//! inline script, on one of three schedules:
//!
//! - `at` - one-shot, fired by the poll once its timestamp has passed
//! - `every` - fixed interval from an anchor, fired by the poll
//! - `cron` - 5-field expression with a timezone, fired by its own timer
//!
//! Jobs live in `cron/jobs/<id>.json`; every fire appends a run record to
//! `cron/runs/<id>.jsonl`.

pub mod expr;
pub mod job;
pub mod schedule;
pub mod scheduler;
pub mod script;
pub mod sink;
pub mod store;

pub use expr::{parse_timezone, CronExpr};
pub use job::{
    CronJob, CronJobPatch, CronJobState, CronPayload, CronRunRecord, JobRuntime, NewCronJob,
    RunStatus,
};
pub use schedule::CronSchedule;
pub use scheduler::{CronScheduler, FireTrigger};
pub use script::{run_script, ScriptOutput};
pub use sink::TaskSink;
pub use store::CronStore;
