//! Message broker abstraction.
//!
//! Workers talk to the broker through the [`Broker`] trait: durable queues
//! addressed by routing key, prefetch-bounded consumers and explicit
//! acknowledgement. The broker handle is acquired once at startup and
//! shared by consumption, dispatch, retry scheduling and dead-lettering.

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;

use crate::errors::BrokerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Stream of deliveries from one consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledges the delivery.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Rejects the delivery, optionally returning it to its queue.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Retry bookkeeping carried by a message rescheduled after a transient
/// failure.
///
/// Travels outside the body (AMQP headers, in-memory envelope) so the
/// attempt ceiling holds across redeliveries and worker restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStamp {
    /// Attempts already made.
    pub attempts: u32,
    /// When the first attempt failed.
    pub first_failed_at: DateTime<Utc>,
}

/// A message received from a queue.
///
/// Must be settled with [`Delivery::ack`] or [`Delivery::nack`]. Until then
/// it counts against the consumer's prefetch.
pub struct Delivery {
    /// Message body.
    pub body: Vec<u8>,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// True if the broker delivered this message before.
    pub redelivered: bool,
    /// Retry state of a rescheduled message, `None` on first delivery.
    pub retry: Option<RetryStamp>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Creates a delivery.
    #[must_use]
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            redelivered,
            retry: None,
            acker,
        }
    }

    /// Attaches the retry stamp the message was rescheduled with.
    #[must_use]
    pub fn with_retry(mut self, retry: Option<RetryStamp>) -> Self {
        self.retry = retry;
        self
    }

    /// Acknowledges the delivery.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Rejects the delivery.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("retry", &self.retry)
            .field("len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// A message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a durable queue bound to its own name as routing key.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publishes a body and waits for the broker to confirm it.
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Publishes a body stamped with `retry` that becomes visible on
    /// `routing_key` once `delay` has elapsed.
    ///
    /// Returns once the broker holds the message, so the caller can settle
    /// the original delivery right away.
    async fn publish_delayed(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        retry: RetryStamp,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Opens a consumer with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError>;

    /// Closes the broker. Open consumer streams end.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Returns the queue (and routing key) of a node.
#[must_use]
pub fn node_queue(prefix: &str, node: &str) -> String {
    format!("{prefix}.node.{node}")
}

/// Connects to the broker named by `url`.
///
/// `memory://` gives an in-process broker; `amqp://` and `amqps://` need the
/// `amqp` feature.
pub async fn connect(url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(InMemoryBroker::new()));
    }

    #[cfg(feature = "amqp")]
    if url.starts_with("amqp://") || url.starts_with("amqps://") {
        return Ok(Arc::new(AmqpBroker::connect(url).await?));
    }

    Err(BrokerError::UnsupportedUrl(url.to_string()))
}
