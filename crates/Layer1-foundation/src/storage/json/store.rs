//! JSON file store
//!
//! Whole-document JSON files plus append-only JSON-lines logs, rooted at a
//! base directory. Document writes go through a sibling temp file and a
//! rename so readers never observe a half-written document.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// JSON document store rooted at a directory
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_dir: PathBuf,
}

impl JsonStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Global config store (`<config dir>/hive/`)
    pub fn global() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?
            .join("hive");
        Ok(Self::new(dir))
    }

    /// Project config store (`<root>/.hive/`)
    pub fn project(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into().join(".hive"))
    }

    /// Project store for the current directory
    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::project(cwd))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    /// Store rooted at a subdirectory of this one
    pub fn child(&self, dir: &str) -> Self {
        Self::new(self.base_dir.join(dir))
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Storage(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }
        Ok(())
    }

    /// Load a JSON document
    pub fn load<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        let path = self.file_path(filename);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Storage(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load a JSON document, falling back to the default value
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, filename: &str) -> T {
        self.load(filename).unwrap_or_default()
    }

    /// Load a JSON document if it exists
    pub fn load_optional<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let path = self.file_path(filename);
        if !path.exists() {
            return Ok(None);
        }
        self.load(filename).map(Some)
    }

    /// Save a JSON document (temp file + rename)
    pub fn save<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        let path = self.file_path(filename);
        self.ensure_parent(&path)?;
        let content = serde_json::to_string_pretty(data)?;
        write_atomic(&path, content.as_bytes())
    }

    /// Append one JSON value as a line
    pub fn append_line<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        let path = self.file_path(filename);
        self.ensure_parent(&path)?;
        let mut line = serde_json::to_string(data)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open {}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes())
            .map_err(|e| Error::Storage(format!("Failed to append {}: {}", path.display(), e)))
    }

    /// Read every parseable line of a JSON-lines file (missing file = empty)
    pub fn read_lines<T: DeserializeOwned>(&self, filename: &str) -> Result<Vec<T>> {
        let path = self.file_path(filename);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Keep only the last `keep` lines of a JSON-lines file
    pub fn truncate_lines(&self, filename: &str, keep: usize) -> Result<()> {
        let path = self.file_path(filename);
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= keep {
            return Ok(());
        }
        let mut kept = lines[lines.len() - keep..].join("\n");
        kept.push('\n');
        write_atomic(&path, kept.as_bytes())
    }

    /// File names (without extension) of `*.json` documents in this directory
    pub fn list_documents(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.base_dir).map_err(|e| {
            Error::Storage(format!("Failed to list {}: {}", self.base_dir.display(), e))
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "json").unwrap_or(false))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Whether a file exists
    pub fn exists(&self, filename: &str) -> bool {
        self.file_path(filename).exists()
    }

    /// Remove a file (missing file is not an error)
    pub fn remove(&self, filename: &str) -> Result<()> {
        let path = self.file_path(filename);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                Error::Storage(format!("Failed to remove {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

/// Write bytes to `path` via a sibling temp file and rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Storage(format!("Invalid path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    std::fs::write(&tmp, bytes)
        .map_err(|e| Error::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::Storage(format!("Failed to replace {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("nested"));

        let doc = Doc {
            name: "alpha".into(),
            count: 3,
        };
        store.save("doc.json", &doc).unwrap();

        let loaded: Doc = store.load("doc.json").unwrap();
        assert_eq!(loaded, doc);
        assert!(store.load_optional::<Doc>("missing.json").unwrap().is_none());
    }

    #[test]
    fn test_append_and_truncate_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        for i in 0..5 {
            store
                .append_line("log.jsonl", &Doc { name: "x".into(), count: i })
                .unwrap();
        }
        store.truncate_lines("log.jsonl", 2).unwrap();

        let lines: Vec<Doc> = store.read_lines("log.jsonl").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].count, 3);
        assert_eq!(lines[1].count, 4);
    }

    #[test]
    fn test_list_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        store.save("b.json", &Doc::default()).unwrap();
        store.save("a.json", &Doc::default()).unwrap();
        store.append_line("c.jsonl", &Doc::default()).unwrap();

        assert_eq!(store.list_documents().unwrap(), vec!["a", "b"]);
    }
}
