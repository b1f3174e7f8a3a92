//! Lifecycle events to pipeline runs.

use super::{DeliveryOutcome, Settlement};
use crate::broker::{Broker, Delivery};
use crate::core::{LifecycleEvent, PipelineMessage};
use crate::errors::{BrokerError, NodeError};
use crate::events::{event_types, EventSink};
use crate::middleware::{DeadLetterPublisher, Dispatcher, RetryPolicy};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Name recorded as the failing node of dead-lettered events.
const EVENTS_NODE: &str = "events";

/// Consumes the lifecycle events queue.
///
/// Entity events start runs at the entry nodes of matching triggers. A
/// `task_finished` event resumes every checkpoint of that task type from its
/// successors.
pub struct TriggerRouter {
    dispatcher: Dispatcher,
    dead_letters: DeadLetterPublisher,
    sink: Arc<dyn EventSink>,
    retry: RetryPolicy,
}

impl TriggerRouter {
    /// Creates a router.
    #[must_use]
    pub fn new(
        dispatcher: Dispatcher,
        dead_letters: DeadLetterPublisher,
        sink: Arc<dyn EventSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            dispatcher,
            dead_letters,
            sink,
            retry,
        }
    }

    /// Processes and settles one event delivery.
    pub async fn handle_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let settlement = Settlement {
            node: EVENTS_NODE,
            policy: &self.retry,
            broker: self.dispatcher.broker().as_ref(),
            sink: self.sink.as_ref(),
            dead_letters: &self.dead_letters,
        };

        let event = match LifecycleEvent::from_bytes(&delivery.body) {
            Ok(event) => event,
            Err(err) => return settlement.malformed(delivery, &err.to_string()).await,
        };
        let correlation_id = match &event {
            LifecycleEvent::TaskFinished { correlation_id, .. } => *correlation_id,
            _ => None,
        };

        settlement
            .run(delivery, correlation_id, |_attempt| {
                let event = &event;
                async move { self.route(event).await.map(|_| ()) }
            })
            .await
    }

    /// Fires every trigger matching `event` and returns how many fired.
    ///
    /// An event no trigger matches is not an error.
    pub async fn route(&self, event: &LifecycleEvent) -> Result<usize, NodeError> {
        let name = event.name();
        let graph = Arc::clone(self.dispatcher.graph());
        let mut fired = 0;

        for entry in graph.entries_for(event) {
            let msg = PipelineMessage::triggered(&name, event.entity_refs().clone(), event.payload().clone());
            self.dispatcher.enter(entry, msg.clone()).await?;
            self.fired(&name, entry, &msg).await;
            fired += 1;
        }

        if let LifecycleEvent::TaskFinished {
            task_type,
            correlation_id,
            entity_refs,
            payload,
        } = event
        {
            for checkpoint in graph.checkpoints_for_task(task_type) {
                let msg = PipelineMessage::resumed(&name, *correlation_id, entity_refs.clone(), payload.clone());
                self.dispatcher.dispatch(checkpoint, &msg, payload.clone()).await?;
                self.fired(&name, checkpoint, &msg).await;
                fired += 1;
            }
        }

        if fired == 0 {
            debug!(event = %name, "No trigger matched event");
            self.sink
                .emit(event_types::TRIGGER_UNMATCHED, Some(json!({ "event": name })))
                .await;
        }
        Ok(fired)
    }

    async fn fired(&self, event: &str, node: &str, msg: &PipelineMessage) {
        info!(
            event,
            node,
            correlation_id = %msg.correlation_id(),
            "Trigger fired"
        );
        self.sink
            .emit(
                event_types::TRIGGER_FIRED,
                Some(json!({
                    "event": event,
                    "node": node,
                    "correlation_id": msg.correlation_id().to_string(),
                })),
            )
            .await;
    }
}

impl std::fmt::Debug for TriggerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRouter")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Publishes a lifecycle event to the events queue.
pub async fn publish_event(
    broker: &dyn Broker,
    queue: &str,
    event: &LifecycleEvent,
) -> Result<(), BrokerError> {
    let body = event
        .to_bytes()
        .map_err(|e| BrokerError::publish(queue, format!("encode: {e}")))?;
    broker.publish(queue, body).await
}
