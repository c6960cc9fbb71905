//! Pause signal file polled by in-container supervisors

use chrono::{DateTime, Utc};
use hive_foundation::{write_atomic, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of `pause.signal`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseSignal {
    pub requested_at: DateTime<Utc>,
    pub message: String,
}

impl PauseSignal {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            requested_at: Utc::now(),
            message: message.into(),
        }
    }

    /// Written fresh on every request
    pub fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(path, content.as_bytes())
    }

    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn clear(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pause.signal");

        PauseSignal::new("stop at next boundary").write(&path).unwrap();
        let signal = PauseSignal::read(&path).unwrap();
        assert_eq!(signal.message, "stop at next boundary");

        PauseSignal::clear(&path).unwrap();
        assert!(PauseSignal::read(&path).is_none());
        PauseSignal::clear(&path).unwrap();
    }
}
