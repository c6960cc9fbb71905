//! # hive-foundation
//!
//! Foundation layer for Hive:
//! - Error: the workspace-wide error type
//! - Storage: JSON documents and JSON-lines logs with atomic replace
//! - Config: `HiveConfig` (global + project `hive.json`)
//! - Event: notification bus for task state transitions
//! - Retry: exponential backoff for transient collaborator errors
//! - Guard: re-entrancy guard for periodic ticks

pub mod config;
pub mod error;
pub mod event;
pub mod guard;
pub mod retry;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    CronSettings, HiveConfig, InProcessSettings, RetrySettings, RuntimeKind, SandboxSettings,
    DATA_DIR_ENV, HIVE_CONFIG_FILE,
};

// ============================================================================
// Storage / Events / Retry / Guard
// ============================================================================
pub use event::{EventBus, EventBusConfig, EventKind, NotificationSink, TaskEvent, TracingSink};
pub use guard::{TickGuard, TickPermit};
pub use retry::{with_retry, RetryConfig};
pub use storage::{write_atomic, JsonStore};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
