//! Cron job persistence
//!
//! - `cron/jobs/<id>.json` - one record per job
//! - `cron/runs/<id>.jsonl` - run history, newest last, capped

use crate::job::{CronJob, CronRunRecord};
use hive_foundation::{JsonStore, Result};
use std::path::Path;
use tracing::warn;

pub struct CronStore {
    jobs: JsonStore,
    runs: JsonStore,
    history_limit: usize,
}

impl CronStore {
    pub fn open(data_dir: impl AsRef<Path>, history_limit: usize) -> Self {
        let root = JsonStore::new(data_dir.as_ref()).child("cron");
        Self {
            jobs: root.child("jobs"),
            runs: root.child("runs"),
            history_limit: history_limit.max(1),
        }
    }

    fn job_file(id: &str) -> String {
        format!("{}.json", id)
    }

    fn run_file(id: &str) -> String {
        format!("{}.jsonl", id)
    }

    /// Every readable job, sorted by creation time; corrupt records are skipped
    pub fn list(&self) -> Result<Vec<CronJob>> {
        let mut jobs = Vec::new();
        for id in self.jobs.list_documents()? {
            match self.jobs.load::<CronJob>(&Self::job_file(&id)) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = %id, error = %e, "Skipping unreadable cron job"),
            }
        }
        jobs.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    pub fn get(&self, id: &str) -> Result<Option<CronJob>> {
        self.jobs.load_optional(&Self::job_file(id))
    }

    pub fn save(&self, job: &CronJob) -> Result<()> {
        self.jobs.save(&Self::job_file(&job.id), job)
    }

    /// Remove a job and its history; returns whether it existed
    pub fn remove(&self, id: &str) -> Result<bool> {
        let existed = self.jobs.exists(&Self::job_file(id));
        self.jobs.remove(&Self::job_file(id))?;
        self.runs.remove(&Self::run_file(id))?;
        Ok(existed)
    }

    pub fn append_run(&self, record: &CronRunRecord) -> Result<()> {
        let file = Self::run_file(&record.job_id);
        self.runs.append_line(&file, record)?;
        self.runs.truncate_lines(&file, self.history_limit)
    }

    /// Run history, oldest first
    pub fn runs(&self, id: &str, limit: Option<usize>) -> Result<Vec<CronRunRecord>> {
        let mut records: Vec<CronRunRecord> = self.runs.read_lines(&Self::run_file(id))?;
        if let Some(limit) = limit {
            if records.len() > limit {
                records.drain(..records.len() - limit);
            }
        }
        Ok(records)
    }
}
