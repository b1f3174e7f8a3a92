//! In-process broker.

use super::{Acknowledger, Broker, Delivery, DeliveryStream, RetryStamp};
use crate::errors::BrokerError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
struct Envelope {
    body: Vec<u8>,
    redelivered: bool,
    retry: Option<RetryStamp>,
}

#[derive(Debug, Default)]
struct Queue {
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Queue {
    fn push(&self, envelope: Envelope) {
        self.messages.lock().push_back(envelope);
        self.notify.notify_one();
    }

    fn requeue(&self, envelope: Envelope) {
        self.messages.lock().push_front(envelope);
        self.notify.notify_one();
    }
}

/// Broker keeping queues in memory.
///
/// Mirrors the AMQP semantics the worker relies on: publishing to a queue
/// name routes to that queue, consumers respect prefetch, and a nack with
/// requeue (or dropping an unsettled delivery) puts the message back at the
/// head of its queue flagged as redelivered. Queues are created on first
/// use. Delayed publishes are held by a timer task and appended to their
/// queue when it fires.
#[derive(Debug)]
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    closed: watch::Sender<bool>,
    publish_failures: AtomicUsize,
    published: AtomicUsize,
    delayed: Arc<AtomicUsize>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            queues: RwLock::new(HashMap::new()),
            closed,
            publish_failures: AtomicUsize::new(0),
            published: AtomicUsize::new(0),
            delayed: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn queue(&self, name: &str) -> Arc<Queue> {
        if let Some(queue) = self.queues.read().get(name) {
            return Arc::clone(queue);
        }
        Arc::clone(self.queues.write().entry(name.to_string()).or_default())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn check_publish(&self, routing_key: &str) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let injected = self
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BrokerError::publish(routing_key, "injected failure"));
        }
        Ok(())
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.publish_failures.store(n, Ordering::SeqCst);
    }

    /// Returns the number of confirmed publishes.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Returns the number of delayed publishes not yet visible in their
    /// queue.
    #[must_use]
    pub fn delayed_count(&self) -> usize {
        self.delayed.load(Ordering::SeqCst)
    }

    /// Returns the number of messages waiting in a queue.
    #[must_use]
    pub fn pending_count(&self, queue: &str) -> usize {
        self.queues
            .read()
            .get(queue)
            .map_or(0, |q| q.messages.lock().len())
    }

    /// Returns the bodies waiting in a queue without consuming them.
    #[must_use]
    pub fn pending(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues.read().get(queue).map_or_else(Vec::new, |q| {
            q.messages.lock().iter().map(|e| e.body.clone()).collect()
        })
    }

    /// Removes and returns the bodies waiting in a queue.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues.read().get(queue).map_or_else(Vec::new, |q| {
            q.messages.lock().drain(..).map(|e| e.body).collect()
        })
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.queue(queue);
        Ok(())
    }

    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.check_publish(routing_key)?;
        self.queue(routing_key).push(Envelope {
            body,
            redelivered: false,
            retry: None,
        });
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_delayed(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        retry: RetryStamp,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        self.check_publish(routing_key)?;
        let queue = self.queue(routing_key);
        let envelope = Envelope {
            body,
            redelivered: false,
            retry: Some(retry),
        };
        self.published.fetch_add(1, Ordering::SeqCst);

        if delay.is_zero() {
            queue.push(envelope);
            return Ok(());
        }
        let delayed = Arc::clone(&self.delayed);
        delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(envelope);
            delayed.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let state = ConsumerState {
            queue: self.queue(queue),
            routing_key: queue.to_string(),
            permits: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
            closed: self.closed.subscribe(),
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            let delivery = state.next_delivery().await?;
            Some((Ok::<_, BrokerError>(delivery), state))
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

struct ConsumerState {
    queue: Arc<Queue>,
    routing_key: String,
    permits: Arc<Semaphore>,
    closed: watch::Receiver<bool>,
}

impl ConsumerState {
    /// Waits for a prefetch slot and a message. `None` once the broker closes.
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
            _ = wait_closed(&mut self.closed) => return None,
        };

        loop {
            if *self.closed.borrow() {
                return None;
            }
            let (next, more) = {
                let mut messages = self.queue.messages.lock();
                let next = messages.pop_front();
                (next, !messages.is_empty())
            };
            if more {
                // Pass the wakeup on to another consumer of this queue.
                self.queue.notify.notify_one();
            }
            if let Some(envelope) = next {
                let acker = MemoryAcker {
                    queue: Arc::clone(&self.queue),
                    envelope: Mutex::new(Some(envelope.clone())),
                    settled: AtomicBool::new(false),
                    permit: Mutex::new(Some(permit)),
                };
                return Some(
                    Delivery::new(
                        envelope.body,
                        self.routing_key.clone(),
                        envelope.redelivered,
                        Box::new(acker),
                    )
                    .with_retry(envelope.retry),
                );
            }
            tokio::select! {
                _ = self.queue.notify.notified() => {}
                _ = wait_closed(&mut self.closed) => return None,
            }
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

struct MemoryAcker {
    queue: Arc<Queue>,
    envelope: Mutex<Option<Envelope>>,
    settled: AtomicBool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Ack("delivery already settled".to_string()));
        }
        let envelope = self.envelope.lock().take();
        if let (true, Some(mut envelope)) = (requeue, envelope) {
            envelope.redelivered = true;
            self.queue.requeue(envelope);
        }
        self.permit.lock().take();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(requeue)
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            let _ = self.settle(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_then_consume() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        broker.publish("q", b"one".to_vec()).await.unwrap();

        let mut stream = broker.consume("q", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        assert_eq!(delivery.body, b"one");
        assert_eq!(delivery.routing_key, "q");
        assert!(!delivery.redelivered);
        delivery.ack().await.unwrap();
        assert_eq!(broker.pending_count("q"), 0);
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn test_consumer_waits_for_publish() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut stream = broker.consume("q", 1).await.unwrap();

        let publisher = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish("q", b"late".to_vec()).await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"late");
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked() {
        let broker = InMemoryBroker::new();
        for body in [b"a", b"b"] {
            broker.publish("q", body.to_vec()).await.unwrap();
        }

        let mut stream = broker.consume("q", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the first ack");

        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"b");
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.publish("q", b"retry-me".to_vec()).await.unwrap();

        let mut stream = broker.consume("q", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.nack(true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"retry-me");
        assert!(again.redelivered);
        again.nack(false).await.unwrap();
        assert_eq!(broker.pending_count("q"), 0);
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let broker = InMemoryBroker::new();
        broker.publish("q", b"x".to_vec()).await.unwrap();

        let mut stream = broker.consume("q", 1).await.unwrap();
        drop(stream.next().await.unwrap().unwrap());

        assert_eq!(broker.pending("q"), vec![b"x".to_vec()]);
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1);

        let err = broker.publish("q", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Publish { .. }));
        assert!(broker.publish("q", b"x".to_vec()).await.is_ok());
        assert_eq!(broker.drain("q").len(), 1);
    }

    #[tokio::test]
    async fn test_delayed_publish_carries_stamp() {
        let broker = InMemoryBroker::new();
        let stamp = RetryStamp {
            attempts: 2,
            first_failed_at: chrono::Utc::now(),
        };
        broker
            .publish_delayed("q", b"later".to_vec(), stamp, Duration::from_millis(30))
            .await
            .unwrap();

        assert_eq!(broker.pending_count("q"), 0);
        assert_eq!(broker.delayed_count(), 1);

        let mut stream = broker.consume("q", 1).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"later");
        assert_eq!(delivery.retry, Some(stamp));
        assert_eq!(broker.delayed_count(), 0);

        // A requeued delivery keeps its stamp.
        delivery.nack(true).await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.retry, Some(stamp));
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.consume("q", 1).await.unwrap();

        broker.close().await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(next.is_none());
        assert_eq!(broker.publish("q", vec![]).await, Err(BrokerError::Closed));
    }
}
