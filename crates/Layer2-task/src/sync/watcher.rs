//! Progress watcher
//!
//! Polls `progress.json` and forwards every changed, parseable snapshot in
//! observation order. Each forwarded snapshot is also appended to
//! `progress.log.jsonl` with a monotonically increasing sequence number.

use super::{ProgressSnapshot, TaskFiles, JOURNAL_FILE};
use chrono::{DateTime, Utc};
use hive_foundation::{JsonStore, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One journaled observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub seq: u64,
    pub observed_at: DateTime<Utc>,
    pub snapshot: ProgressSnapshot,
}

struct WatchState {
    files: TaskFiles,
    journal: JsonStore,
    last_raw: Option<String>,
    next_seq: u64,
}

impl WatchState {
    fn new(files: TaskFiles) -> Self {
        let journal = JsonStore::new(files.dir());
        let next_seq = journal
            .read_lines::<JournalEntry>(JOURNAL_FILE)
            .ok()
            .and_then(|entries| entries.last().map(|e| e.seq + 1))
            .unwrap_or(0);
        Self {
            files,
            journal,
            last_raw: None,
            next_seq,
        }
    }

    /// Check the file once; returns a snapshot only when its content changed
    fn observe(&mut self) -> Option<ProgressSnapshot> {
        let raw = std::fs::read_to_string(self.files.progress_path()).ok()?;
        if self.last_raw.as_deref() == Some(raw.as_str()) {
            return None;
        }
        // A write racing with our read parses as garbage; retry next poll
        let snapshot: ProgressSnapshot = serde_json::from_str(&raw).ok()?;
        self.last_raw = Some(raw);

        let entry = JournalEntry {
            seq: self.next_seq,
            observed_at: Utc::now(),
            snapshot: snapshot.clone(),
        };
        self.next_seq += 1;
        if let Err(e) = self.journal.append_line(JOURNAL_FILE, &entry) {
            warn!(task_id = %self.files.task_id(), error = %e, "Failed to journal progress");
        }
        Some(snapshot)
    }
}

/// Background poller for one task's progress file
pub struct ProgressWatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    latest: Arc<Mutex<Option<ProgressSnapshot>>>,
}

impl ProgressWatcher {
    /// Start polling every `interval`, sending changed snapshots to `tx`
    pub fn spawn(
        files: TaskFiles,
        interval: Duration,
        tx: mpsc::UnboundedSender<ProgressSnapshot>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let latest = Arc::new(Mutex::new(None));

        let token = cancel.clone();
        let latest_slot = Arc::clone(&latest);
        let handle = tokio::spawn(async move {
            let mut state = WatchState::new(files);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(snapshot) = state.observe() {
                            debug!(
                                task_id = %state.files.task_id(),
                                status = %snapshot.status,
                                "Progress observed"
                            );
                            *latest_slot.lock() = Some(snapshot.clone());
                            if tx.send(snapshot).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            cancel,
            handle,
            latest,
        }
    }

    /// Last snapshot forwarded by this watcher
    pub fn latest(&self) -> Option<ProgressSnapshot> {
        self.latest.lock().clone()
    }

    /// Stop polling and wait for the poller to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Progress watcher ended abnormally");
        }
    }

    /// Every journaled observation for a task, oldest first
    pub fn journal(files: &TaskFiles) -> Result<Vec<JournalEntry>> {
        JsonStore::new(files.dir()).read_lines(JOURNAL_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ProgressStatus;
    use crate::task::TaskId;

    #[test]
    fn test_observe_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let files = TaskFiles::new(dir.path(), &TaskId::from("task-w"));
        let mut state = WatchState::new(files.clone());

        assert!(state.observe().is_none());

        files
            .write_progress(&ProgressSnapshot::new("task-w", ProgressStatus::InProgress))
            .unwrap();
        assert!(state.observe().is_some());
        assert!(state.observe().is_none());

        std::fs::write(files.progress_path(), "{\"taskId\":").unwrap();
        assert!(state.observe().is_none());

        files
            .write_progress(
                &ProgressSnapshot::new("task-w", ProgressStatus::Completed).with_percent(100.0),
            )
            .unwrap();
        let done = state.observe().unwrap();
        assert_eq!(done.status, ProgressStatus::Completed);

        let journal = ProgressWatcher::journal(&files).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].seq, 0);
        assert_eq!(journal[1].seq, 1);
    }

    #[test]
    fn test_sequence_continues_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let files = TaskFiles::new(dir.path(), &TaskId::from("task-r"));
        files
            .write_progress(&ProgressSnapshot::new("task-r", ProgressStatus::InProgress))
            .unwrap();
        WatchState::new(files.clone()).observe().unwrap();

        files
            .write_progress(&ProgressSnapshot::new("task-r", ProgressStatus::Blocked))
            .unwrap();
        WatchState::new(files.clone()).observe().unwrap();

        let journal = ProgressWatcher::journal(&files).unwrap();
        assert_eq!(journal.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_watcher_forwards_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let files = TaskFiles::new(dir.path(), &TaskId::from("task-s"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = ProgressWatcher::spawn(files.clone(), Duration::from_millis(10), tx);

        files
            .write_progress(
                &ProgressSnapshot::new("task-s", ProgressStatus::WaitingForHuman)
                    .with_question("A or B?"),
            )
            .unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.pending_question(), Some("A or B?"));
        assert_eq!(watcher.latest(), Some(snapshot));
        watcher.stop().await;
    }
}
