//! Hive Config - control plane settings
//!
//! Loaded from the global `hive.json` and then the project `.hive/hive.json`;
//! keys present in the project file override the global ones.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Config file name
pub const HIVE_CONFIG_FILE: &str = "hive.json";

/// Environment variable overriding `dataDir`
pub const DATA_DIR_ENV: &str = "HIVE_DATA_DIR";

// ============================================================================
// Runtime kind
// ============================================================================

/// Which runtime adapter executes a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// Collaborator driven inside the control-plane process
    #[default]
    InProcess,
    /// Isolated container
    Sandbox,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::InProcess => write!(f, "in-process"),
            RuntimeKind::Sandbox => write!(f, "sandbox"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-process" | "inprocess" | "local" => Ok(RuntimeKind::InProcess),
            "sandbox" | "container" => Ok(RuntimeKind::Sandbox),
            other => Err(Error::InvalidInput(format!("unknown runtime: {}", other))),
        }
    }
}

// ============================================================================
// Hive Config
// ============================================================================

/// Top-level control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HiveConfig {
    /// Root of all durable state
    pub data_dir: PathBuf,

    /// Scheduler loop period
    pub tick_interval_ms: u64,

    /// Runtime used when the assignment does not pick one
    pub default_runtime: RuntimeKind,

    pub cron: CronSettings,

    pub retry: RetrySettings,

    pub sandbox: SandboxSettings,

    pub in_process: InProcessSettings,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".hive/data"),
            tick_interval_ms: 5_000,
            default_runtime: RuntimeKind::InProcess,
            cron: CronSettings::default(),
            retry: RetrySettings::default(),
            sandbox: SandboxSettings::default(),
            in_process: InProcessSettings::default(),
        }
    }
}

impl HiveConfig {
    /// Global + project merged load, then environment overrides
    pub fn load() -> Result<Self> {
        let mut merged = serde_json::Value::Object(Default::default());

        if let Ok(global) = JsonStore::global() {
            if let Some(value) = global.load_optional::<serde_json::Value>(HIVE_CONFIG_FILE)? {
                merge_json(&mut merged, value);
            }
        }

        if let Ok(project) = JsonStore::current_project() {
            if let Some(value) = project.load_optional::<serde_json::Value>(HIVE_CONFIG_FILE)? {
                merge_json(&mut merged, value);
            }
        }

        let mut config: HiveConfig = serde_json::from_value(merged)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", HIVE_CONFIG_FILE, e)))?;
        config.apply_env();
        Ok(config)
    }

    /// Load a single explicit config file
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let mut config: HiveConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", path.display(), e)))?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Builder: data directory
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }
}

/// Deep-merge `overlay` into `base`; objects merge key by key, anything else replaces
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ============================================================================
// Cron Settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronSettings {
    /// Poll period for `every`/`at` jobs
    pub poll_interval_ms: u64,

    /// Re-sync period for registered `cron` jobs
    pub reconcile_interval_ms: u64,

    /// Inline script timeout
    pub script_timeout_ms: u64,

    /// Run records kept per job
    pub history_limit: usize,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            reconcile_interval_ms: 60_000,
            script_timeout_ms: 300_000,
            history_limit: 200,
        }
    }
}

// ============================================================================
// Retry Settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

// ============================================================================
// Sandbox Settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSettings {
    /// Container image
    pub image: String,

    /// Entrypoint command (empty = image default)
    pub command: Vec<String>,

    /// Shared read-only resources (defaults to `<dataDir>/shared`)
    pub shared_dir: Option<PathBuf>,

    /// Per-actor private directories (defaults to `<dataDir>/actors`)
    pub actors_dir: Option<PathBuf>,

    /// Static config/entrypoint artifacts, host path -> container path, read-only
    pub static_mounts: BTreeMap<PathBuf, PathBuf>,

    /// Host variables forwarded into the container
    pub credential_env: Vec<String>,

    /// Variable toggling the optional tool-augmentation feature
    pub tool_augmentation_env: String,

    /// Whether tool augmentation is enabled on first attempt
    pub tool_augmentation: bool,

    /// How long to wait for a lagging final snapshot after exit
    pub exit_grace_ms: u64,

    /// Progress file poll period
    pub progress_poll_ms: u64,

    /// Docker network mode
    pub network: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "hive-worker:latest".to_string(),
            command: Vec::new(),
            shared_dir: None,
            actors_dir: None,
            static_mounts: BTreeMap::new(),
            credential_env: Vec::new(),
            tool_augmentation_env: "HIVE_TOOL_AUGMENTATION".to_string(),
            tool_augmentation: true,
            exit_grace_ms: 5_000,
            progress_poll_ms: 500,
            network: "bridge".to_string(),
        }
    }
}

impl SandboxSettings {
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn progress_poll(&self) -> Duration {
        Duration::from_millis(self.progress_poll_ms.max(10))
    }
}

// ============================================================================
// In-process Settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InProcessSettings {
    /// Child contexts a single parent may run at once
    pub max_children: usize,

    /// Maximum nesting depth below the root context
    pub max_depth: u32,

    /// Upper bound on collaborator turns per run
    pub max_turns: u32,
}

impl Default for InProcessSettings {
    fn default() -> Self {
        Self {
            max_children: 4,
            max_depth: 2,
            max_turns: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: HiveConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tick_interval_ms, 5_000);
        assert_eq!(config.cron.poll_interval_ms, 5_000);
        assert_eq!(config.cron.reconcile_interval_ms, 60_000);
        assert_eq!(config.default_runtime, RuntimeKind::InProcess);
        assert_eq!(config.sandbox.exit_grace_ms, 5_000);
    }

    #[test]
    fn test_merge_overrides_nested_keys() {
        let mut base = serde_json::json!({
            "tickIntervalMs": 1000,
            "sandbox": { "image": "a", "network": "none" }
        });
        merge_json(
            &mut base,
            serde_json::json!({ "sandbox": { "image": "b" }, "defaultRuntime": "sandbox" }),
        );

        let config: HiveConfig = serde_json::from_value(base).unwrap();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.sandbox.image, "b");
        assert_eq!(config.sandbox.network, "none");
        assert_eq!(config.default_runtime, RuntimeKind::Sandbox);
    }

    #[test]
    fn test_runtime_kind_parse() {
        assert_eq!("sandbox".parse::<RuntimeKind>().unwrap(), RuntimeKind::Sandbox);
        assert_eq!(
            "in-process".parse::<RuntimeKind>().unwrap(),
            RuntimeKind::InProcess
        );
        assert!("vm".parse::<RuntimeKind>().is_err());
    }
}
