//! Dead-letter publication.

use crate::broker::Broker;
use crate::core::DeadLetterRecord;
use crate::errors::BrokerError;
use crate::events::{event_types, EventSink};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

/// Publishes dead-letter records on the worker's shared broker handle.
#[derive(Clone)]
pub struct DeadLetterPublisher {
    broker: Arc<dyn Broker>,
    queue: String,
    sink: Arc<dyn EventSink>,
}

impl DeadLetterPublisher {
    /// Creates a publisher writing to `queue`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            sink,
        }
    }

    /// Returns the dead-letter queue name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publishes a record. On error the caller must keep the delivery.
    pub async fn publish(&self, record: &DeadLetterRecord) -> Result<(), BrokerError> {
        let body = record
            .to_bytes()
            .map_err(|e| BrokerError::publish(&self.queue, format!("encode: {e}")))?;
        self.broker.publish(&self.queue, body).await?;

        error!(
            node = record.failing_node(),
            correlation_id = ?record.correlation_id(),
            error_kind = %record.error_kind(),
            attempts = record.attempt_count(),
            detail = record.error_detail(),
            "Message dead-lettered"
        );
        self.sink
            .emit(
                event_types::NODE_DEAD_LETTERED,
                Some(json!({
                    "node": record.failing_node(),
                    "correlation_id": record.correlation_id().map(|id| id.to_string()),
                    "error_kind": record.error_kind(),
                    "error_detail": record.error_detail(),
                    "attempts": record.attempt_count(),
                })),
            )
            .await;
        Ok(())
    }
}

impl std::fmt::Debug for DeadLetterPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterPublisher")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::errors::ErrorKind;
    use crate::events::CollectingEventSink;
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_record() {
        let broker = Arc::new(InMemoryBroker::new());
        let sink = Arc::new(CollectingEventSink::new());
        let publisher = DeadLetterPublisher::new(broker.clone(), "dlq", sink.clone());

        let record = DeadLetterRecord::new(b"{}", "anonymize", ErrorKind::HandlerDomainError, "bad", 1, Utc::now());
        publisher.publish(&record).await.unwrap();

        let bodies = broker.drain("dlq");
        assert_eq!(bodies.len(), 1);
        let stored = DeadLetterRecord::from_bytes(&bodies[0]).unwrap();
        assert_eq!(stored.failing_node(), "anonymize");
        assert_eq!(sink.count_for_node(event_types::NODE_DEAD_LETTERED, "anonymize"), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_next_publishes(1);
        let publisher = DeadLetterPublisher::new(broker.clone(), "dlq", Arc::new(CollectingEventSink::new()));

        let record = DeadLetterRecord::new(b"x", "n", ErrorKind::MalformedMessage, "bad", 1, Utc::now());
        assert!(publisher.publish(&record).await.is_err());
        assert_eq!(broker.pending_count("dlq"), 0);
    }
}
