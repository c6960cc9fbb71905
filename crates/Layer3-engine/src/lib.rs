//! # hive-engine
//!
//! The Hive scheduler. A periodic tick moves tasks from `pending` through
//! assignment to a running `TaskRunner`, and the engine reacts to what the
//! runners report:
//!
//! - Freeze / resume (global or per task), rest and day boundary signals
//! - Alignment: a task waiting for a human captures operator input until it
//!   continues on its own or the operator ends the session
//! - Crash recovery of tasks a previous process left running
//!
//! The engine also implements `hive_cron::TaskSink`, so cron jobs enqueue
//! through it.

pub mod assign;
pub mod engine;
pub mod input;
pub mod signal;
pub mod state;

pub use assign::{
    available_executors, AssignmentCollaborator, AssignmentDecision, AssignmentView, AutoAssigner,
    DEFAULT_EXECUTOR,
};
pub use engine::Engine;
pub use input::{InputRoute, InputScope, END_ALIGNMENT_COMMAND};
pub use signal::{Signal, SignalFiles, SignalScope, SIGNALS_DIR};
pub use state::{AlignmentSession, SchedulerSnapshot, SchedulerState};
