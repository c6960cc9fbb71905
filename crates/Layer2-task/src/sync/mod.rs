//! Progress Sync Channel
//!
//! File-based contract between the control plane and an execution
//! environment, one directory per task under `<dataDir>/tasks/<taskId>/`:
//!
//! - `progress.json` - latest `ProgressSnapshot`, rewritten wholesale by the environment
//! - `inbox.json` - `{ messages, updatedAt }`, appended by us, drained by the environment
//! - `pause.signal` - `{ requestedAt, message }`, urgent stop request
//! - `progress.log.jsonl` - ordered journal of every snapshot we observed

mod inbox;
mod pause;
mod progress;
mod watcher;

pub use inbox::InboxDocument;
pub use pause::PauseSignal;
pub use progress::{Checkpoint, ProgressSnapshot, ProgressStatus};
pub use watcher::{JournalEntry, ProgressWatcher};

use crate::task::TaskId;
use hive_foundation::{Error, Result};
use std::path::{Path, PathBuf};

/// Per-task directory root under the data dir
pub const TASKS_DIR: &str = "tasks";

pub const PROGRESS_FILE: &str = "progress.json";
pub const INBOX_FILE: &str = "inbox.json";
pub const PAUSE_SIGNAL_FILE: &str = "pause.signal";
pub const JOURNAL_FILE: &str = "progress.log.jsonl";

/// Paths of one task's synchronization files
#[derive(Debug, Clone)]
pub struct TaskFiles {
    task_id: TaskId,
    dir: PathBuf,
}

impl TaskFiles {
    pub fn new(data_dir: impl AsRef<Path>, task_id: &TaskId) -> Self {
        Self {
            task_id: task_id.clone(),
            dir: data_dir.as_ref().join(TASKS_DIR).join(task_id.as_str()),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn progress_path(&self) -> PathBuf {
        self.dir.join(PROGRESS_FILE)
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.dir.join(INBOX_FILE)
    }

    pub fn pause_signal_path(&self) -> PathBuf {
        self.dir.join(PAUSE_SIGNAL_FILE)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    /// Create the task directory if missing
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            Error::Storage(format!("Failed to create {}: {}", self.dir.display(), e))
        })
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Latest snapshot; `None` when missing or mid-write (unparseable)
    pub fn read_progress(&self) -> Option<ProgressSnapshot> {
        ProgressSnapshot::read(&self.progress_path())
    }

    pub fn write_progress(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        self.ensure_dir()?;
        snapshot.write(&self.progress_path())
    }

    // ========================================================================
    // Inbox
    // ========================================================================

    /// Append one message to the inbox
    pub fn push_inbox(&self, message: impl Into<String>) -> Result<()> {
        self.ensure_dir()?;
        InboxDocument::append(&self.inbox_path(), message.into())
    }

    /// Read and clear the inbox
    pub fn drain_inbox(&self) -> Result<Vec<String>> {
        InboxDocument::drain(&self.inbox_path())
    }

    /// Read the inbox without clearing it
    pub fn peek_inbox(&self) -> Vec<String> {
        InboxDocument::read(&self.inbox_path()).messages
    }

    // ========================================================================
    // Pause signal
    // ========================================================================

    pub fn write_pause_signal(&self, message: impl Into<String>) -> Result<PauseSignal> {
        self.ensure_dir()?;
        let signal = PauseSignal::new(message);
        signal.write(&self.pause_signal_path())?;
        Ok(signal)
    }

    pub fn read_pause_signal(&self) -> Option<PauseSignal> {
        PauseSignal::read(&self.pause_signal_path())
    }

    pub fn clear_pause_signal(&self) -> Result<()> {
        PauseSignal::clear(&self.pause_signal_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let files = TaskFiles::new("/data", &TaskId::from("task-1"));
        assert_eq!(files.dir(), Path::new("/data/tasks/task-1"));
        assert_eq!(
            files.progress_path(),
            PathBuf::from("/data/tasks/task-1/progress.json")
        );
        assert_eq!(
            files.pause_signal_path(),
            PathBuf::from("/data/tasks/task-1/pause.signal")
        );
    }

    #[test]
    fn test_missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = TaskFiles::new(dir.path(), &TaskId::from("task-x"));
        assert!(files.read_progress().is_none());
        assert!(files.peek_inbox().is_empty());
        assert!(files.drain_inbox().unwrap().is_empty());
        assert!(files.read_pause_signal().is_none());
        files.clear_pause_signal().unwrap();
    }
}
