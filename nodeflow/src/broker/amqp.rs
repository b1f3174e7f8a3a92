//! AMQP 0-9-1 broker backed by lapin.

use super::{Acknowledger, Broker, Delivery, DeliveryStream, RetryStamp};
use crate::errors::BrokerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const PERSISTENT: u8 = 2;
const ATTEMPTS_HEADER: &str = "x-nodeflow-attempts";
const FIRST_FAILED_HEADER: &str = "x-nodeflow-first-failed-at";

/// Broker speaking AMQP over one connection.
///
/// Publishes go through a single confirm-mode channel on the default
/// exchange with the queue name as routing key. Each consumer gets its own
/// channel so prefetch applies per consumer.
///
/// Delayed publishes wait in a `<queue>.retry` queue with a per-message
/// expiration and are dead-lettered back to `<queue>` when it runs out.
/// RabbitMQ only expires messages at the head of a queue, so a retry can
/// wait behind a longer one scheduled before it, never less than asked.
pub struct AmqpBroker {
    connection: Connection,
    publisher: Channel,
    retry_queues: Mutex<HashSet<String>>,
}

impl AmqpBroker {
    /// Connects and opens the publishing channel.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!(url = %redact(url), "Connected to AMQP broker");
        Ok(Self {
            connection,
            publisher,
            retry_queues: Mutex::new(HashSet::new()),
        })
    }

    async fn send(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        let confirmation = self
            .publisher
            .basic_publish("", routing_key, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| BrokerError::publish(routing_key, e.to_string()))?
            .await
            .map_err(|e| BrokerError::publish(routing_key, e.to_string()))?;

        if confirmation.is_nack() {
            return Err(BrokerError::publish(routing_key, "broker nacked the publish"));
        }
        Ok(())
    }

    /// Declares the holding queue for delayed publishes to `routing_key`.
    async fn retry_queue(&self, routing_key: &str) -> Result<String, BrokerError> {
        let queue = format!("{routing_key}.retry");
        if self.retry_queues.lock().contains(&queue) {
            return Ok(queue);
        }

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(routing_key)),
        );
        self.publisher
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("declare '{queue}': {e}")))?;

        self.retry_queues.lock().insert(queue.clone());
        Ok(queue)
    }
}

fn persistent() -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(ShortString::from("application/json"))
}

fn stamp_headers(retry: RetryStamp) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(ShortString::from(ATTEMPTS_HEADER), AMQPValue::LongUInt(retry.attempts));
    headers.insert(
        ShortString::from(FIRST_FAILED_HEADER),
        AMQPValue::LongString(LongString::from(retry.first_failed_at.to_rfc3339())),
    );
    headers
}

fn read_stamp(properties: &BasicProperties) -> Option<RetryStamp> {
    let headers = properties.headers().as_ref()?.inner();
    let attempts = match headers.get(&ShortString::from(ATTEMPTS_HEADER))? {
        AMQPValue::LongUInt(n) => *n,
        AMQPValue::LongInt(n) => u32::try_from(*n).ok()?,
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok()?,
        _ => return None,
    };
    let first_failed_at = match headers.get(&ShortString::from(FIRST_FAILED_HEADER))? {
        AMQPValue::LongString(s) => DateTime::parse_from_rfc3339(std::str::from_utf8(s.as_bytes()).ok()?)
            .ok()?
            .with_timezone(&Utc),
        _ => return None,
    };
    Some(RetryStamp {
        attempts,
        first_failed_at,
    })
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.publisher
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("declare '{queue}': {e}")))?;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.send(routing_key, &body, persistent()).await
    }

    async fn publish_delayed(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        retry: RetryStamp,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let queue = self.retry_queue(routing_key).await?;
        let properties = persistent()
            .with_headers(stamp_headers(retry))
            .with_expiration(ShortString::from(delay.as_millis().to_string()));
        self.send(&queue, &body, properties).await
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let tag = format!("{queue}-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("consume '{queue}': {e}")))?;
        debug!(queue, consumer_tag = %tag, prefetch, "Consumer opened");

        let stream = consumer.map(|item| {
            item.map(|delivery| {
                let retry = read_stamp(&delivery.properties);
                Delivery::new(
                    delivery.data,
                    delivery.routing_key.as_str(),
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                )
                .with_retry(retry)
            })
            .map_err(|e| BrokerError::Connection(e.to_string()))
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "worker shutdown")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_credentials() {
        assert_eq!(redact("amqp://user:pw@rabbit:5672/%2f"), "amqp://***@rabbit:5672/%2f");
        assert_eq!(redact("amqp://rabbit:5672"), "amqp://rabbit:5672");
    }

    #[test]
    fn test_retry_stamp_survives_headers() {
        let stamp = RetryStamp {
            attempts: 3,
            first_failed_at: DateTime::parse_from_rfc3339("2026-03-01T08:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let properties = persistent().with_headers(stamp_headers(stamp));

        assert_eq!(read_stamp(&properties), Some(stamp));
        assert_eq!(read_stamp(&persistent()), None);
    }
}
