//! An in-process worker for end-to-end tests.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::broker::{node_queue, InMemoryBroker};
use crate::cancellation::CancellationToken;
use crate::config::Settings;
use crate::core::{DeadLetterRecord, LifecycleEvent, PipelineMessage};
use crate::errors::{BrokerError, NodeflowError};
use crate::events::CollectingEventSink;
use crate::pipeline::PipelineGraph;
use crate::runtime::{publish_event, WorkerRuntime};
use crate::services::InMemoryTaskService;

/// A worker running over an in-memory broker and task service.
///
/// Every event is collected so tests can assert on what happened.
pub struct TestWorker {
    /// The broker shared by the worker and the test.
    pub broker: Arc<InMemoryBroker>,
    /// The task service checkpoints park in.
    pub tasks: Arc<InMemoryTaskService>,
    /// Every event emitted by the worker.
    pub events: Arc<CollectingEventSink>,
    settings: Settings,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), NodeflowError>>,
}

impl TestWorker {
    /// Starts a worker for `graph`.
    #[must_use]
    pub fn start(graph: PipelineGraph, settings: Settings) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let tasks = Arc::new(InMemoryTaskService::new());
        let events = Arc::new(CollectingEventSink::new());

        let runtime = WorkerRuntime::new(Arc::new(graph), broker.clone(), tasks.clone(), settings.clone())
            .with_event_sink(events.clone());
        let cancel = runtime.cancellation_token();
        let handle = tokio::spawn(async move { runtime.run().await });

        Self {
            broker,
            tasks,
            events,
            settings,
            cancel,
            handle,
        }
    }

    /// Publishes a lifecycle event to the worker's events queue.
    pub async fn publish(&self, event: &LifecycleEvent) -> Result<(), BrokerError> {
        publish_event(self.broker.as_ref(), &self.settings.events_queue, event).await
    }

    /// Returns the dead-letter records written so far, without consuming
    /// them.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.broker
            .pending(&self.settings.dead_letter_queue)
            .iter()
            .filter_map(|body| DeadLetterRecord::from_bytes(body).ok())
            .collect()
    }

    /// Returns the messages waiting in a node's queue.
    #[must_use]
    pub fn queued_for(&self, node: &str) -> Vec<PipelineMessage> {
        self.broker
            .pending(&node_queue(&self.settings.queue_prefix, node))
            .iter()
            .filter_map(|body| PipelineMessage::from_bytes(body).ok())
            .collect()
    }

    /// Cancels the worker and waits for it to stop.
    pub async fn stop(self) -> Result<(), NodeflowError> {
        self.cancel.cancel("test finished");
        match tokio::time::timeout(Duration::from_secs(5), self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(BrokerError::Connection(format!("worker task failed: {join}")).into()),
            Err(_) => Err(BrokerError::Connection("worker did not stop in time".to_string()).into()),
        }
    }
}
