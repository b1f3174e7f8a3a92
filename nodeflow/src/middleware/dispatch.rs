//! Routing a node's output to its successors.

use crate::broker::{node_queue, Broker};
use crate::core::{Payload, PipelineMessage, StepOutcome, StepRecord};
use crate::errors::NodeError;
use crate::events::{event_types, EventSink};
use crate::pipeline::{Node, PipelineGraph};
use crate::services::TaskService;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// What a dispatch produced.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Messages published to executable successors.
    pub published: Vec<PipelineMessage>,
    /// Branches parked at checkpoints, with the checkpoint name.
    pub parked: Vec<(String, PipelineMessage)>,
    /// Set when the node had no successor to dispatch.
    pub terminal: Option<PipelineMessage>,
}

impl DispatchReport {
    /// Returns true if the branch ended at this node.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Returns the number of successor messages produced.
    #[must_use]
    pub fn fan_out(&self) -> usize {
        self.published.len() + self.parked.len()
    }
}

/// Publishes successor messages and parks branches at checkpoints.
///
/// Holds the worker's shared broker handle. Dispatch is not atomic: when a
/// publish fails halfway through a fan-out the whole unit is retried and
/// already published branches are published again.
#[derive(Clone)]
pub struct Dispatcher {
    graph: Arc<PipelineGraph>,
    broker: Arc<dyn Broker>,
    tasks: Arc<dyn TaskService>,
    sink: Arc<dyn EventSink>,
    prefix: String,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        graph: Arc<PipelineGraph>,
        broker: Arc<dyn Broker>,
        tasks: Arc<dyn TaskService>,
        sink: Arc<dyn EventSink>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            broker,
            tasks,
            sink,
            prefix: prefix.into(),
        }
    }

    /// Returns the graph routed over.
    #[must_use]
    pub fn graph(&self) -> &Arc<PipelineGraph> {
        &self.graph
    }

    /// Returns the broker messages are published to.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Returns the queue prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Dispatches `payload`, the validated output of `from`, to the
    /// successors that fire for it.
    ///
    /// `from` is an executable node, or a checkpoint being resumed by its
    /// completion trigger.
    pub async fn dispatch(
        &self,
        from: &str,
        msg: &PipelineMessage,
        payload: Payload,
    ) -> Result<DispatchReport, NodeError> {
        let successors = self.graph.resolve_successors(from, &payload);
        let outcome = if self.graph.is_checkpoint(from) {
            StepOutcome::Resumed
        } else {
            StepOutcome::Completed
        };

        let mut report = DispatchReport::default();
        if successors.is_empty() {
            let terminal = msg.forward(payload, StepRecord::new(from, StepOutcome::Terminal));
            info!(
                node = from,
                correlation_id = %msg.correlation_id(),
                "Branch reached a terminal node"
            );
            self.sink
                .emit(
                    event_types::BRANCH_TERMINAL,
                    Some(json!({
                        "node": from,
                        "correlation_id": msg.correlation_id().to_string(),
                    })),
                )
                .await;
            report.terminal = Some(terminal);
            return Ok(report);
        }

        let forked = successors.len() > 1;
        for target in &successors {
            let mut record = StepRecord::new(from, outcome);
            if forked {
                record = record.with_branch(target.as_str());
            }
            let next = msg.forward(payload.clone(), record);
            self.route(target, next, msg.message_id(), &mut report).await?;
        }

        debug!(
            node = from,
            correlation_id = %msg.correlation_id(),
            successors = ?successors,
            "Dispatched output"
        );
        Ok(report)
    }

    /// Sends a freshly triggered message to an entry node.
    pub async fn enter(
        &self,
        entry: &str,
        msg: PipelineMessage,
    ) -> Result<DispatchReport, NodeError> {
        let mut report = DispatchReport::default();
        let source = msg.message_id();
        self.route(entry, msg, source, &mut report).await?;
        Ok(report)
    }

    /// `source` is the id of the message being dispatched. It stays the same
    /// across redeliveries, so it keys checkpoint tasks.
    async fn route(
        &self,
        target: &str,
        mut msg: PipelineMessage,
        source: Uuid,
        report: &mut DispatchReport,
    ) -> Result<(), NodeError> {
        match self.graph.node(target) {
            Some(Node::Checkpoint(cp)) => {
                let key = task_key(msg.correlation_id(), target, source);
                let task_id = self
                    .tasks
                    .mark_task(&cp.task_type, msg.correlation_id(), msg.entity_refs(), &key)
                    .await?;
                msg.record(StepRecord::new(target, StepOutcome::Parked));
                info!(
                    node = target,
                    task_type = %cp.task_type,
                    task_id = %task_id,
                    correlation_id = %msg.correlation_id(),
                    "Branch parked at checkpoint"
                );
                self.sink
                    .emit(
                        event_types::BRANCH_PARKED,
                        Some(json!({
                            "node": target,
                            "task_type": cp.task_type,
                            "task_id": task_id,
                            "correlation_id": msg.correlation_id().to_string(),
                        })),
                    )
                    .await;
                report.parked.push((target.to_string(), msg));
            }
            _ => {
                let routing_key = node_queue(&self.prefix, target);
                let body = msg.to_bytes().map_err(|e| {
                    crate::errors::BrokerError::publish(&routing_key, format!("encode: {e}"))
                })?;
                self.broker.publish(&routing_key, body).await?;
                debug!(
                    routing_key = %routing_key,
                    message_id = %msg.message_id(),
                    correlation_id = %msg.correlation_id(),
                    "Published message"
                );
                report.published.push(msg);
            }
        }
        Ok(())
    }
}

/// Idempotency key of the task opened when `source` parks at `checkpoint`.
#[must_use]
pub fn task_key(correlation_id: Uuid, checkpoint: &str, source: Uuid) -> String {
    format!("{correlation_id}:{checkpoint}:{source}")
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("graph", &self.graph.name())
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::core::EntityRefs;
    use crate::errors::ServiceError;
    use crate::events::CollectingEventSink;
    use crate::nodes::Passthrough;
    use crate::pipeline::{Branch, Condition, GraphBuilder, NodeSpec};
    use crate::services::{InMemoryTaskService, MockTaskService};
    use pretty_assertions::assert_eq;

    fn node(name: &str) -> NodeSpec {
        NodeSpec::new(name, Arc::new(Passthrough))
    }

    fn graph() -> Arc<PipelineGraph> {
        Arc::new(
            GraphBuilder::new("dispatch")
                .node(node("a"))
                .node(node("b"))
                .node(node("c"))
                .node(node("d"))
                .checkpoint("review", "review_task")
                .on_event("patient_created", "a")
                .then("a", ["b", "review"])
                .then("b", Branch::when(Condition::field_equals("ok", false), "c"))
                .then("review", "d")
                .build()
                .unwrap(),
        )
    }

    fn setup(
        tasks: Arc<dyn TaskService>,
    ) -> (Dispatcher, Arc<InMemoryBroker>, Arc<CollectingEventSink>) {
        let broker = Arc::new(InMemoryBroker::new());
        let sink = Arc::new(CollectingEventSink::new());
        let dispatcher = Dispatcher::new(graph(), broker.clone(), tasks, sink.clone(), "t");
        (dispatcher, broker, sink)
    }

    fn start() -> PipelineMessage {
        PipelineMessage::triggered("patient_created", EntityRefs::new(), Payload::new())
    }

    #[tokio::test]
    async fn test_fan_out_publishes_and_parks() {
        let tasks = Arc::new(InMemoryTaskService::new());
        let (dispatcher, broker, sink) = setup(tasks.clone());
        let msg = start();

        let report = dispatcher.dispatch("a", &msg, Payload::new()).await.unwrap();

        assert_eq!(report.fan_out(), 2);
        assert_eq!(broker.pending_count("t.node.b"), 1);
        assert_eq!(tasks.tasks_of_type("review_task").len(), 1);
        assert_eq!(sink.count(event_types::BRANCH_PARKED), 1);

        let published = &report.published[0];
        let (_, parked) = &report.parked[0];
        assert_eq!(published.correlation_id(), parked.correlation_id());
        assert_eq!(published.history()[1].branch.as_deref(), Some("b"));
        assert_eq!(parked.history()[1].branch.as_deref(), Some("review"));
        assert_eq!(parked.history().last().unwrap().outcome, StepOutcome::Parked);
    }

    #[tokio::test]
    async fn test_redispatch_reuses_checkpoint_task() {
        let tasks = Arc::new(InMemoryTaskService::new());
        let (dispatcher, _, _) = setup(tasks.clone());
        let msg = start();

        dispatcher.dispatch("a", &msg, Payload::new()).await.unwrap();
        dispatcher.dispatch("a", &msg, Payload::new()).await.unwrap();

        assert_eq!(tasks.tasks_of_type("review_task").len(), 1);
        assert_eq!(
            tasks.tasks()[0].idempotency_key,
            task_key(msg.correlation_id(), "review", msg.message_id())
        );
    }

    #[tokio::test]
    async fn test_mark_task_receives_idempotency_key() {
        let msg = start();
        let expected = task_key(msg.correlation_id(), "review", msg.message_id());
        let mut tasks = MockTaskService::new();
        tasks
            .expect_mark_task()
            .withf(move |task_type, _, _, key| task_type == "review_task" && key == expected)
            .times(1)
            .returning(|_, _, _, _| Ok("task-1".to_string()));
        let (dispatcher, _, _) = setup(Arc::new(tasks));

        let report = dispatcher.dispatch("a", &msg, Payload::new()).await.unwrap();
        assert_eq!(report.parked.len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_condition_is_terminal() {
        let (dispatcher, broker, sink) = setup(Arc::new(InMemoryTaskService::new()));
        let mut output = Payload::new();
        output.insert("ok".to_string(), json!(true));

        let report = dispatcher.dispatch("b", &start(), output).await.unwrap();

        assert!(report.is_terminal());
        assert_eq!(broker.published_count(), 0);
        assert_eq!(sink.count(event_types::BRANCH_TERMINAL), 1);
        let terminal = report.terminal.unwrap();
        assert_eq!(terminal.history().last().unwrap().outcome, StepOutcome::Terminal);
    }

    #[tokio::test]
    async fn test_single_successor_has_no_branch() {
        let (dispatcher, broker, _) = setup(Arc::new(InMemoryTaskService::new()));
        let mut output = Payload::new();
        output.insert("ok".to_string(), json!(false));

        let report = dispatcher.dispatch("b", &start(), output).await.unwrap();

        assert_eq!(report.published.len(), 1);
        assert_eq!(report.published[0].history()[1].branch, None);
        assert_eq!(broker.pending_count("t.node.c"), 1);
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint_records_resumed() {
        let (dispatcher, _, _) = setup(Arc::new(InMemoryTaskService::new()));
        let msg = PipelineMessage::resumed("review_task_finished", None, EntityRefs::new(), Payload::new());

        let report = dispatcher.dispatch("review", &msg, Payload::new()).await.unwrap();

        let record = &report.published[0].history()[1];
        assert_eq!(record.node, "review");
        assert_eq!(record.outcome, StepOutcome::Resumed);
    }

    #[tokio::test]
    async fn test_task_service_failure_is_transient() {
        let mut tasks = MockTaskService::new();
        tasks
            .expect_mark_task()
            .returning(|_, _, _, _| Err(ServiceError::Unavailable("down".to_string())));
        let (dispatcher, _, _) = setup(Arc::new(tasks));

        let err = dispatcher.dispatch("a", &start(), Payload::new()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_publish_failure_is_transient() {
        let (dispatcher, broker, _) = setup(Arc::new(InMemoryTaskService::new()));
        broker.fail_next_publishes(1);

        let err = dispatcher.enter("a", start()).await.unwrap_err();
        assert!(matches!(err, NodeError::Broker(_)));
        assert!(err.is_transient());
    }
}
