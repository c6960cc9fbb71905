//! Event System - control plane notifications
//!
//! ```text
//! state transition ──► EventBus::publish ──► history
//!                                         ├─► broadcast receivers
//!                                         └─► NotificationSink (log, chat bridge, ...)
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusConfig, ListenerId, NotificationSink, TracingSink};
pub use types::{EventKind, TaskEvent};
