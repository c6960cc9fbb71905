//! Event Bus - notification fan-out
//!
//! The control plane publishes a `TaskEvent` for every state transition.
//! Sinks (chat bridges, dashboards, the log) subscribe and receive each event
//! in publish order.

use super::types::{EventKind, TaskEvent};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

// ============================================================================
// NotificationSink Trait
// ============================================================================

/// Listener ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receives human-readable event strings
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Sink name (for logs)
    fn name(&self) -> &str;

    /// Event kinds this sink wants (`None` = all)
    fn kinds(&self) -> Option<Vec<EventKind>> {
        None
    }

    async fn notify(&self, event: &TaskEvent);
}

/// Sink that writes every event to the log
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn notify(&self, event: &TaskEvent) {
        if event.kind.is_attention() {
            warn!(kind = event.kind.as_str(), "{}", event);
        } else {
            info!(kind = event.kind.as_str(), "{}", event);
        }
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity
    pub channel_capacity: usize,

    /// Events kept in history
    pub history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_size: 200,
        }
    }
}

/// Event bus
///
/// ```ignore
/// let bus = EventBus::new();
/// bus.subscribe(Arc::new(TracingSink)).await;
/// bus.publish(TaskEvent::task("t-1", EventKind::Started, "started")).await;
/// ```
pub struct EventBus {
    config: EventBusConfig,

    sender: broadcast::Sender<TaskEvent>,

    sinks: RwLock<HashMap<ListenerId, Arc<dyn NotificationSink>>>,

    listener_counter: AtomicU64,

    history: RwLock<VecDeque<TaskEvent>>,

    event_count: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));

        Self {
            config,
            sender,
            sinks: RwLock::new(HashMap::new()),
            listener_counter: AtomicU64::new(0),
            history: RwLock::new(VecDeque::new()),
            event_count: AtomicU64::new(0),
        }
    }

    /// Register a sink
    pub async fn subscribe(&self, sink: Arc<dyn NotificationSink>) -> ListenerId {
        let id = ListenerId(self.listener_counter.fetch_add(1, Ordering::SeqCst));
        debug!(sink = sink.name(), listener_id = %id, "Registering notification sink");
        self.sinks.write().await.insert(id, sink);
        id
    }

    /// Remove a sink
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        self.sinks.write().await.remove(&id).is_some()
    }

    /// Publish an event to history, the broadcast channel, and every sink
    pub async fn publish(&self, event: TaskEvent) {
        self.event_count.fetch_add(1, Ordering::SeqCst);

        {
            let mut history = self.history.write().await;
            history.push_back(event.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        let _ = self.sender.send(event.clone());

        let sinks = self.sinks.read().await;
        for sink in sinks.values() {
            let wanted = match sink.kinds() {
                Some(kinds) => kinds.contains(&event.kind),
                None => true,
            };
            if wanted {
                sink.notify(&event).await;
            }
        }
    }

    /// Stream-style receiver
    pub fn receiver(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Most recent events, newest first
    pub async fn history(&self, limit: Option<usize>) -> Vec<TaskEvent> {
        let history = self.history.read().await;
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Events concerning one task, oldest first
    pub async fn history_for(&self, task_id: &str) -> Vec<TaskEvent> {
        self.history
            .read()
            .await
            .iter()
            .filter(|e| e.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        kinds: Option<Vec<EventKind>>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        fn kinds(&self) -> Option<Vec<EventKind>> {
            self.kinds.clone()
        }

        async fn notify(&self, _event: &TaskEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_sinks() {
        let bus = EventBus::new();
        let all = Arc::new(CountingSink {
            kinds: None,
            count: AtomicUsize::new(0),
        });
        let failures = Arc::new(CountingSink {
            kinds: Some(vec![EventKind::Failed]),
            count: AtomicUsize::new(0),
        });
        bus.subscribe(all.clone()).await;
        bus.subscribe(failures.clone()).await;

        bus.publish(TaskEvent::task("t-1", EventKind::Started, "started"))
            .await;
        bus.publish(TaskEvent::task("t-1", EventKind::Failed, "failed: exit 1"))
            .await;

        assert_eq!(all.count.load(Ordering::SeqCst), 2);
        assert_eq!(failures.count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.event_count(), 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = EventBus::with_config(EventBusConfig {
            channel_capacity: 8,
            history_size: 3,
        });
        for i in 0..5 {
            bus.publish(TaskEvent::task(
                format!("t-{}", i),
                EventKind::Enqueued,
                "enqueued",
            ))
            .await;
        }

        let history = bus.history(None).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].task_id.as_deref(), Some("t-4"));
        assert_eq!(bus.history_for("t-3").await.len(), 1);
        assert!(bus.history_for("t-0").await.is_empty());
    }

    #[tokio::test]
    async fn test_receiver_gets_events() {
        let bus = EventBus::new();
        let mut rx = bus.receiver();
        bus.publish(TaskEvent::global(EventKind::Frozen, "frozen"))
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Frozen);
    }
}
