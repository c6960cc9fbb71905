//! Inbox: control plane to execution environment messages

use chrono::{DateTime, Utc};
use hive_foundation::{write_atomic, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// One lock per inbox path, shared by every writer and drainer in this process
static INBOX_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

fn inbox_lock(path: &Path) -> Arc<Mutex<()>> {
    let locks = INBOX_LOCKS.get_or_init(Default::default);
    Arc::clone(locks.lock().entry(path.to_path_buf()).or_default())
}

/// Contents of `inbox.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxDocument {
    #[serde(default)]
    pub messages: Vec<String>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for InboxDocument {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

impl InboxDocument {
    /// Current inbox; missing or unreadable means empty
    pub fn read(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Unparseable inbox, treating as empty");
            Self::default()
        })
    }

    fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(path, content.as_bytes())
    }

    /// Append by rewriting the full array
    pub fn append(path: &Path, message: String) -> Result<()> {
        let lock = inbox_lock(path);
        let _guard = lock.lock();
        let mut doc = Self::read(path);
        doc.messages.push(message);
        doc.updated_at = Utc::now();
        doc.write(path)?;
        debug!(path = %path.display(), pending = doc.messages.len(), "Inbox message appended");
        Ok(())
    }

    /// Read then immediately rewrite with an empty array
    pub fn drain(path: &Path) -> Result<Vec<String>> {
        let lock = inbox_lock(path);
        let _guard = lock.lock();
        let doc = Self::read(path);
        if doc.messages.is_empty() {
            return Ok(Vec::new());
        }
        Self::default().write(path)?;
        Ok(doc.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_twice_returns_empty_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.json");

        InboxDocument::append(&path, "first".into()).unwrap();
        InboxDocument::append(&path, "second".into()).unwrap();

        assert_eq!(
            InboxDocument::drain(&path).unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );
        assert!(InboxDocument::drain(&path).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_append_and_drain_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.json");
        let sent = 200;

        let writer = {
            let path = path.clone();
            std::thread::spawn(move || {
                for i in 0..sent {
                    InboxDocument::append(&path, format!("m{}", i)).unwrap();
                }
            })
        };

        let mut received = Vec::new();
        while !writer.is_finished() {
            received.extend(InboxDocument::drain(&path).unwrap());
        }
        writer.join().unwrap();
        received.extend(InboxDocument::drain(&path).unwrap());

        let expected: Vec<String> = (0..sent).map(|i| format!("m{}", i)).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_messages_persist_until_drained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.json");
        InboxDocument::append(&path, "hold".into()).unwrap();

        assert_eq!(InboxDocument::read(&path).messages, vec!["hold".to_string()]);
        assert_eq!(InboxDocument::read(&path).messages, vec!["hold".to_string()]);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.get("updatedAt").is_some());
    }
}
