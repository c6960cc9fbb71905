//! Config - control plane settings
//!
//! - `hive.rs` - HiveConfig and its sections

mod hive;

pub use hive::{
    CronSettings, HiveConfig, InProcessSettings, RetrySettings, RuntimeKind, SandboxSettings,
    DATA_DIR_ENV, HIVE_CONFIG_FILE,
};
