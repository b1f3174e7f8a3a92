//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Trait for event sinks that receive runtime events.
///
/// The runtime emits one event per lifecycle step of a delivery (see
/// [`event_types`](super::event_types)). Sinks are passed into the runtime
/// explicitly.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "node.completed")
    /// * `data` - Optional event data
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without blocking.
    ///
    /// Must never fail; problems are logged and suppressed.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// A sink that writes events to the tracing subscriber.
///
/// `node` and `correlation_id` are lifted out of the event data into log
/// fields so they can be filtered on.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: &Option<serde_json::Value>) {
        let field = |key: &str| {
            data.as_ref()
                .and_then(|d| d.get(key))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string()
        };
        let node = field("node");
        let correlation_id = field("correlation_id");

        if self.level == Level::DEBUG {
            debug!(event_type, node, correlation_id, event_data = ?data, "Event: {}", event_type);
        } else {
            info!(event_type, node, correlation_id, event_data = ?data, "Event: {}", event_type);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }
}

/// A sink that keeps every event, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns the data of every event of exactly `event_type`.
    #[must_use]
    pub fn data_of(&self, event_type: &str) -> Vec<serde_json::Value> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .map(|(_, d)| d.clone().unwrap_or(serde_json::Value::Null))
            .collect()
    }

    /// Returns the number of events of exactly `event_type`.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events.read().iter().filter(|(t, _)| t == event_type).count()
    }

    /// Returns the number of events of `event_type` concerning `node`.
    #[must_use]
    pub fn count_for_node(&self, event_type: &str, node: &str) -> usize {
        self.data_of(event_type)
            .iter()
            .filter(|d| d.get("node").and_then(serde_json::Value::as_str) == Some(node))
            .count()
    }

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit("node.started", None).await;
        let sink = LoggingEventSink::debug();
        sink.emit("node.completed", Some(json!({"node": "anonymize"}))).await;
        sink.try_emit("branch.terminal", Some(json!("not an object")));
    }

    #[tokio::test]
    async fn test_collecting_sink_counts() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("node.completed", Some(json!({"node": "anonymize"}))).await;
        sink.emit("node.completed", Some(json!({"node": "get_birads"}))).await;
        sink.try_emit("branch.parked", Some(json!({"node": "quality_check"})));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.count("node.completed"), 2);
        assert_eq!(sink.count_for_node("node.completed", "get_birads"), 1);
        assert_eq!(sink.events_of_type("branch.").len(), 1);
        assert_eq!(sink.data_of("branch.parked")[0]["node"], json!("quality_check"));
    }
}
