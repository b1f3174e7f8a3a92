//! The worker runtime.
//!
//! A worker consumes the queues of the nodes it can run plus the lifecycle
//! events queue. Every delivery gets one attempt of its unit of work and is
//! settled exactly once: acknowledged on success, after a dead-letter
//! record was written, or after a retry copy was scheduled; requeued when
//! neither the record nor the retry copy could be published.

mod executor;
mod triggers;
mod worker;

pub use executor::NodeExecutor;
pub use triggers::{publish_event, TriggerRouter};
pub use worker::WorkerRuntime;

use crate::broker::{Broker, Delivery, RetryStamp};
use crate::core::DeadLetterRecord;
use crate::errors::{BrokerError, ErrorKind, NodeError};
use crate::events::{event_types, EventSink};
use crate::middleware::{should_retry, DeadLetterPublisher, RetryDecision, RetryPolicy, RetryState};
use chrono::Utc;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed and acknowledged.
    Acked,
    /// A delayed copy was published for the next attempt, then the
    /// delivery was acknowledged.
    RetryScheduled,
    /// Dead-lettered, then acknowledged.
    DeadLettered(ErrorKind),
    /// Returned to its queue.
    Requeued,
}

/// Runs one attempt of the unit of work for a delivery and settles it.
pub(crate) struct Settlement<'a> {
    pub(crate) node: &'a str,
    pub(crate) policy: &'a RetryPolicy,
    pub(crate) broker: &'a dyn Broker,
    pub(crate) sink: &'a dyn EventSink,
    pub(crate) dead_letters: &'a DeadLetterPublisher,
}

impl Settlement<'_> {
    /// Runs `unit` once. `unit` receives the 1-based attempt number, counted
    /// across redeliveries of the same message.
    pub(crate) async fn run<F, Fut>(
        &self,
        delivery: Delivery,
        correlation_id: Option<Uuid>,
        unit: F,
    ) -> DeliveryOutcome
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = Result<(), NodeError>>,
    {
        let mut state = delivery
            .retry
            .map_or_else(RetryState::new, |stamp| {
                RetryState::resumed(stamp.attempts, stamp.first_failed_at)
            });
        let attempt = state.begin_attempt();
        let err = match unit(attempt).await {
            Ok(()) => {
                settle(delivery.ack().await, self.node);
                return DeliveryOutcome::Acked;
            }
            Err(err) => err,
        };

        let (kind, detail) = match should_retry(&mut state, self.policy, err.is_transient()) {
            RetryDecision::Retry(delay) => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    node = self.node,
                    correlation_id = ?correlation_id,
                    attempt,
                    delay_ms,
                    error = %err,
                    "Transient failure, retrying"
                );
                self.sink
                    .emit(
                        event_types::NODE_RETRY_SCHEDULED,
                        Some(json!({
                            "node": self.node,
                            "correlation_id": correlation_id.map(|id| id.to_string()),
                            "attempt": attempt,
                            "delay_ms": delay_ms,
                            "error": err.to_string(),
                        })),
                    )
                    .await;
                return self.reschedule(delivery, &state, delay).await;
            }
            RetryDecision::GiveUp => (
                ErrorKind::RetryExhausted,
                format!("gave up after {attempt} attempts: {err}"),
            ),
            RetryDecision::NotRetryable => (err.kind(), err.to_string()),
        };

        let record = DeadLetterRecord::new(
            &delivery.body,
            self.node,
            kind,
            detail,
            attempt,
            state.first_failed_at(),
        );
        self.dead_letter(delivery, &record).await
    }

    /// Dead-letters a delivery whose body could not be parsed.
    pub(crate) async fn malformed(&self, delivery: Delivery, reason: &str) -> DeliveryOutcome {
        let record = DeadLetterRecord::new(
            &delivery.body,
            self.node,
            ErrorKind::MalformedMessage,
            reason,
            1,
            Utc::now(),
        );
        self.dead_letter(delivery, &record).await
    }

    /// Hands the next attempt to the broker so the consumer slot is freed
    /// for the rest of the queue while the delay runs.
    async fn reschedule(&self, delivery: Delivery, state: &RetryState, delay: Duration) -> DeliveryOutcome {
        let stamp = RetryStamp {
            attempts: state.attempt,
            first_failed_at: state.first_failed_at(),
        };
        match self
            .broker
            .publish_delayed(&delivery.routing_key, delivery.body.clone(), stamp, delay)
            .await
        {
            Ok(()) => {
                settle(delivery.ack().await, self.node);
                DeliveryOutcome::RetryScheduled
            }
            Err(err) => {
                warn!(
                    node = self.node,
                    error = %err,
                    "Could not schedule retry, requeueing delivery"
                );
                settle(delivery.nack(true).await, self.node);
                DeliveryOutcome::Requeued
            }
        }
    }

    async fn dead_letter(&self, delivery: Delivery, record: &DeadLetterRecord) -> DeliveryOutcome {
        match self.dead_letters.publish(record).await {
            Ok(()) => {
                settle(delivery.ack().await, self.node);
                DeliveryOutcome::DeadLettered(record.error_kind())
            }
            Err(err) => {
                warn!(
                    node = self.node,
                    error = %err,
                    "Dead-letter publish failed, requeueing delivery"
                );
                settle(delivery.nack(true).await, self.node);
                DeliveryOutcome::Requeued
            }
        }
    }
}

fn settle(result: Result<(), BrokerError>, node: &str) {
    if let Err(err) = result {
        warn!(node, error = %err, "Failed to settle delivery");
    }
}
