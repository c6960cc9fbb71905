//! Scheduler signals
//!
//! Signals reach the scheduler two ways: in-process through `Engine::signal`,
//! and from other processes (the CLI) as one JSON file per signal under
//! `<dataDir>/signals/`. Both are drained at the start of every tick.

use hive_foundation::{now_ms, JsonStore, Result};
use hive_task::TaskId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

pub const SIGNALS_DIR: &str = "signals";

/// Whom a freeze/resume applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalScope {
    #[default]
    Global,
    Task(TaskId),
}

impl std::fmt::Display for SignalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalScope::Global => write!(f, "global"),
            SignalScope::Task(id) => write!(f, "task {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    /// Hard freeze: pause runners immediately
    Freeze {
        #[serde(default)]
        scope: SignalScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    Resume {
        #[serde(default)]
        scope: SignalScope,
    },

    /// Soft rest: ask every active runner to checkpoint at its next boundary
    Rest,

    /// Clears resting
    DayBoundary,

    #[serde(rename_all = "camelCase")]
    TaskAdded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
    },

    /// Soft alignment request for one task
    #[serde(rename_all = "camelCase")]
    RequestAlignment { task_id: TaskId, message: String },
}

impl Signal {
    pub fn freeze_all(reason: Option<String>) -> Self {
        Signal::Freeze {
            scope: SignalScope::Global,
            reason,
        }
    }

    pub fn freeze_task(task_id: TaskId) -> Self {
        Signal::Freeze {
            scope: SignalScope::Task(task_id),
            reason: None,
        }
    }

    pub fn resume_all() -> Self {
        Signal::Resume {
            scope: SignalScope::Global,
        }
    }

    pub fn resume_task(task_id: TaskId) -> Self {
        Signal::Resume {
            scope: SignalScope::Task(task_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Freeze { .. } => "freeze",
            Signal::Resume { .. } => "resume",
            Signal::Rest => "rest",
            Signal::DayBoundary => "day-boundary",
            Signal::TaskAdded { .. } => "task-added",
            Signal::RequestAlignment { .. } => "request-alignment",
        }
    }
}

/// File-based signal queue shared with other processes
#[derive(Debug, Clone)]
pub struct SignalFiles {
    store: JsonStore,
}

impl SignalFiles {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            store: JsonStore::new(data_dir.as_ref()).child(SIGNALS_DIR),
        }
    }

    /// Queue a signal for the running daemon
    pub fn send(&self, signal: &Signal) -> Result<()> {
        let name = format!("{:013}-{}.json", now_ms(), Uuid::new_v4().simple());
        self.store.save(&name, signal)
    }

    /// Take every queued signal in send order; unreadable files are dropped
    pub fn drain(&self) -> Result<Vec<Signal>> {
        let mut signals = Vec::new();
        for name in self.store.list_documents()? {
            let file = format!("{}.json", name);
            match self.store.load::<Signal>(&file) {
                Ok(signal) => signals.push(signal),
                Err(e) => warn!(file = %file, error = %e, "Dropping unreadable signal file"),
            }
            self.store.remove(&file)?;
        }
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_json_shape() {
        let json = serde_json::to_value(Signal::freeze_task(TaskId::from("task-1"))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "freeze", "scope": { "task": "task-1" } })
        );

        let parsed: Signal = serde_json::from_str(r#"{ "type": "freeze" }"#).unwrap();
        assert_eq!(parsed, Signal::freeze_all(None));

        let parsed: Signal = serde_json::from_str(
            r#"{ "type": "request-alignment", "taskId": "task-2", "message": "stop" }"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            Signal::RequestAlignment {
                task_id: TaskId::from("task-2"),
                message: "stop".into()
            }
        );
    }

    #[test]
    fn test_files_drain_in_order_once() {
        let dir = tempfile::tempdir().unwrap();
        let files = SignalFiles::new(dir.path());
        files.send(&Signal::Rest).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        files.send(&Signal::DayBoundary).unwrap();
        std::fs::write(dir.path().join("signals/0000000000000-bad.json"), "nope").unwrap();

        assert_eq!(
            files.drain().unwrap(),
            vec![Signal::Rest, Signal::DayBoundary]
        );
        assert!(files.drain().unwrap().is_empty());
    }
}
