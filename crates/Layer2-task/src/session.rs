//! Session Store - task id to resumable execution-session handle
//!
//! One `sessions/<taskId>.json` file per task holding `{ "sessionId": ... }`.
//! Sessions are never deleted automatically so a finished task can still be
//! resumed for post-mortem work.

use crate::task::TaskId;
use hive_foundation::{JsonStore, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Sessions directory under the data dir
pub const SESSIONS_DIR: &str = "sessions";

/// Persisted session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    store: JsonStore,
}

impl SessionStore {
    pub fn open(data_dir: impl AsRef<Path>) -> Self {
        Self {
            store: JsonStore::new(data_dir.as_ref()).child(SESSIONS_DIR),
        }
    }

    fn filename(task_id: &TaskId) -> String {
        format!("{}.json", task_id)
    }

    /// Persisted session id, if any
    pub fn get(&self, task_id: &TaskId) -> Result<Option<String>> {
        Ok(self
            .store
            .load_optional::<SessionRecord>(&Self::filename(task_id))?
            .map(|r| r.session_id)
            .filter(|id| !id.is_empty()))
    }

    /// Rewrite the session file (called on every checkpoint)
    pub fn save(&self, task_id: &TaskId, session_id: &str) -> Result<()> {
        if self.get(task_id)?.as_deref() == Some(session_id) {
            return Ok(());
        }
        self.store.save(
            &Self::filename(task_id),
            &SessionRecord {
                session_id: session_id.to_string(),
            },
        )?;
        debug!(task_id = %task_id, session_id, "Session saved");
        Ok(())
    }

    pub fn exists(&self, task_id: &TaskId) -> bool {
        matches!(self.get(task_id), Ok(Some(_)))
    }

    /// Explicit removal (operator cleanup only)
    pub fn remove(&self, task_id: &TaskId) -> Result<()> {
        self.store.remove(&Self::filename(task_id))
    }
}
