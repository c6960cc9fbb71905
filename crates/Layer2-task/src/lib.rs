//! # hive-task
//!
//! Task lifecycle for Hive.
//! Holds the durable task record, drives execution through runtime adapters
//! and keeps the file-based progress channel in sync.
//!
//! ## Features
//!
//! - Task model and forward-only status machine
//! - Task Store (`tasks.json`) and Session Store (`sessions/<id>.json`)
//! - Progress Sync Channel: progress snapshot, inbox, pause signal, journal
//! - Runtime adapters: in-process (execution tree) and sandboxed (containers)
//! - Task Runner: one per active task, mirrors adapter events into the store

pub mod adapter;
pub mod runner;
pub mod session;
pub mod state;
pub mod store;
pub mod sync;
pub mod task;

// Task model
pub use state::TaskStatus;
pub use task::{Assignment, CreatedBy, Priority, Task, TaskId, TaskSpec};

// Persistence
pub use session::{SessionRecord, SessionStore};
pub use store::TaskStore;
pub use sync::{
    Checkpoint, InboxDocument, JournalEntry, PauseSignal, ProgressSnapshot, ProgressStatus,
    ProgressWatcher, TaskFiles,
};

// Execution
pub use adapter::{
    AdapterContext, AdapterEvent, AdapterFactory, AdapterState, ChildReport, ChildSpec,
    ContainerRuntime, ContainerSpec, DockerRuntime, ExecutionCollaborator, InProcessAdapter,
    RuntimeAdapter, RuntimeAdapterFactory, SandboxAdapter, TreeLimits, TurnOutcome, TurnRequest,
    TurnStatus,
};
pub use runner::{RunnerEvent, TaskRunner};
