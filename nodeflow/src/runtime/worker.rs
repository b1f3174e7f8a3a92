//! Worker process lifecycle: queue declaration, consumers, shutdown.

use super::{DeliveryOutcome, NodeExecutor, TriggerRouter};
use crate::broker::{node_queue, Broker, Delivery, DeliveryStream};
use crate::cancellation::CancellationToken;
use crate::config::Settings;
use crate::errors::{BrokerError, NodeflowError};
use crate::events::{EventSink, LoggingEventSink};
use crate::middleware::{DeadLetterPublisher, Dispatcher};
use crate::pipeline::{NodeSpec, PipelineGraph};
use crate::services::TaskService;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// A worker process serving one pipeline graph.
///
/// Owns nothing but explicit handles: the graph, the broker connection and
/// the task service are passed in, and the event sink and cancellation
/// token can be replaced before [`run`](Self::run).
pub struct WorkerRuntime {
    graph: Arc<PipelineGraph>,
    broker: Arc<dyn Broker>,
    tasks: Arc<dyn TaskService>,
    settings: Settings,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl WorkerRuntime {
    /// Creates a runtime logging its events.
    #[must_use]
    pub fn new(
        graph: Arc<PipelineGraph>,
        broker: Arc<dyn Broker>,
        tasks: Arc<dyn TaskService>,
        settings: Settings,
    ) -> Self {
        Self {
            graph,
            broker,
            tasks,
            settings,
            sink: Arc::new(LoggingEventSink::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the cancellation token that stops [`run`](Self::run).
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns a handle to the runtime's cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns the executable nodes whose required capabilities this
    /// process offers.
    #[must_use]
    pub fn consumed_nodes(&self) -> Vec<&NodeSpec> {
        self.graph
            .executable_nodes()
            .filter(|spec| spec.requires.is_subset(&self.settings.capabilities))
            .collect()
    }

    fn concurrency_for(&self, spec: &NodeSpec) -> usize {
        self.settings.concurrency_for(&spec.name, spec.concurrency)
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.broker),
            Arc::clone(&self.tasks),
            Arc::clone(&self.sink),
            self.settings.queue_prefix.clone(),
        )
    }

    fn dead_letters(&self) -> DeadLetterPublisher {
        DeadLetterPublisher::new(
            Arc::clone(&self.broker),
            self.settings.dead_letter_queue.clone(),
            Arc::clone(&self.sink),
        )
    }

    /// Declares every queue the graph uses.
    ///
    /// Queues of nodes this process does not consume are declared too, so
    /// publishes to them are kept until a capable worker starts.
    pub async fn declare_queues(&self) -> Result<(), BrokerError> {
        self.broker.declare_queue(&self.settings.dead_letter_queue).await?;
        self.broker.declare_queue(&self.settings.events_queue).await?;
        for spec in self.graph.executable_nodes() {
            self.broker
                .declare_queue(&node_queue(&self.settings.queue_prefix, &spec.name))
                .await?;
        }
        Ok(())
    }

    /// Runs until the cancellation token fires or a consumer fails.
    ///
    /// On shutdown consumers stop taking deliveries, in-flight deliveries
    /// finish and the broker is closed. Retries waiting on their delay are
    /// held by the broker, not by this process.
    pub async fn run(&self) -> Result<(), NodeflowError> {
        self.declare_queues().await?;

        let dispatcher = self.dispatcher();
        let dead_letters = self.dead_letters();
        let mut consumers: JoinSet<Result<(), BrokerError>> = JoinSet::new();

        let nodes = self.consumed_nodes();
        if nodes.is_empty() {
            warn!(
                graph = self.graph.name(),
                capabilities = ?self.settings.capabilities,
                "No node of the graph can run on this worker"
            );
        }

        for spec in nodes {
            let queue = node_queue(&self.settings.queue_prefix, &spec.name);
            let limit = self.concurrency_for(spec);
            let stream = self.broker.consume(&queue, prefetch(limit)).await?;
            let executor = Arc::new(NodeExecutor::new(
                spec.clone(),
                dispatcher.clone(),
                dead_letters.clone(),
                Arc::clone(&self.tasks),
                Arc::clone(&self.sink),
                self.settings.retry.clone(),
                self.settings.default_timeout(),
            ));
            info!(node = %spec.name, queue = %queue, concurrency = limit, "Consumer started");

            consumers.spawn(consume(queue, stream, limit, self.cancel.clone(), move |delivery| {
                let executor = Arc::clone(&executor);
                async move { executor.handle_delivery(delivery).await }
            }));
        }

        let limit = self.settings.default_concurrency.max(1);
        let stream = self
            .broker
            .consume(&self.settings.events_queue, prefetch(limit))
            .await?;
        let router = Arc::new(TriggerRouter::new(
            dispatcher,
            dead_letters,
            Arc::clone(&self.sink),
            self.settings.retry.clone(),
        ));
        consumers.spawn(consume(
            self.settings.events_queue.clone(),
            stream,
            limit,
            self.cancel.clone(),
            move |delivery| {
                let router = Arc::clone(&router);
                async move { router.handle_delivery(delivery).await }
            },
        ));
        info!(graph = self.graph.name(), "Worker running");

        let mut failure = None;
        while let Some(joined) = consumers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(err) => {
                    error!(error = %err, "Consumer task failed");
                    Ok(())
                }
            };
            if let Err(err) = result {
                self.cancel.cancel(format!("consumer failed: {err}"));
                failure.get_or_insert(err);
            }
        }

        self.broker.close().await?;
        info!(graph = self.graph.name(), "Worker stopped");
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("graph", &self.graph.name())
            .field("settings", &self.settings)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

fn prefetch(limit: usize) -> u16 {
    u16::try_from(limit).unwrap_or(u16::MAX)
}

/// Pulls deliveries from one stream, running at most `limit` at a time.
async fn consume<H, Fut>(
    queue: String,
    mut stream: DeliveryStream,
    limit: usize,
    cancel: CancellationToken,
    handle: H,
) -> Result<(), BrokerError>
where
    H: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DeliveryOutcome> + Send + 'static,
{
    let slots = Arc::new(Semaphore::new(limit));
    let mut result = Ok(());

    loop {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                let task = handle(delivery);
                tokio::spawn(async move {
                    let _permit = permit;
                    task.await
                });
            }
            Some(Err(err)) => {
                error!(queue = %queue, error = %err, "Consumer stream failed");
                result = Err(err);
                break;
            }
            None => break,
        }
    }

    // Every slot free means every spawned delivery has settled.
    let all = u32::try_from(limit).unwrap_or(u32::MAX);
    if slots.acquire_many(all).await.is_err() {
        warn!(queue = %queue, "Could not wait for in-flight deliveries");
    }
    info!(queue = %queue, "Consumer stopped");
    result
}
