//! Execution of one node for one delivery.

use super::{DeliveryOutcome, Settlement};
use crate::broker::Delivery;
use crate::contracts::{ContractViolation, Direction, ValidationIssue};
use crate::core::{NodeOutput, PipelineMessage};
use crate::errors::NodeError;
use crate::events::{event_types, EventSink};
use crate::middleware::{DeadLetterPublisher, DispatchReport, Dispatcher, RetryPolicy};
use crate::nodes::NodeContext;
use crate::observability::SpanTimer;
use crate::pipeline::NodeSpec;
use crate::services::TaskService;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, Instrument};

/// Runs a node's handler for deliveries from its queue.
pub struct NodeExecutor {
    spec: NodeSpec,
    dispatcher: Dispatcher,
    dead_letters: DeadLetterPublisher,
    tasks: Arc<dyn TaskService>,
    sink: Arc<dyn EventSink>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl NodeExecutor {
    /// Creates an executor for `spec`. The node's own timeout wins over
    /// `default_timeout`.
    #[must_use]
    pub fn new(
        spec: NodeSpec,
        dispatcher: Dispatcher,
        dead_letters: DeadLetterPublisher,
        tasks: Arc<dyn TaskService>,
        sink: Arc<dyn EventSink>,
        retry: RetryPolicy,
        default_timeout: Option<Duration>,
    ) -> Self {
        let timeout = spec.timeout.or(default_timeout);
        Self {
            spec,
            dispatcher,
            dead_letters,
            tasks,
            sink,
            retry,
            timeout,
        }
    }

    /// Returns the node name.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.spec.name
    }

    /// Processes and settles one delivery.
    pub async fn handle_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let settlement = Settlement {
            node: &self.spec.name,
            policy: &self.retry,
            broker: self.dispatcher.broker().as_ref(),
            sink: self.sink.as_ref(),
            dead_letters: &self.dead_letters,
        };

        let msg = match PipelineMessage::from_bytes(&delivery.body) {
            Ok(msg) => msg,
            Err(err) => return settlement.malformed(delivery, &err.to_string()).await,
        };

        let span = info_span!(
            "node",
            node = %self.spec.name,
            correlation_id = %msg.correlation_id(),
            message_id = %msg.message_id(),
        );
        settlement
            .run(delivery, Some(msg.correlation_id()), |attempt| {
                let msg = &msg;
                async move {
                    let report = self.run_once(msg, attempt).await?;
                    self.sink
                        .emit(
                            event_types::NODE_COMPLETED,
                            Some(json!({
                                "node": self.spec.name,
                                "correlation_id": msg.correlation_id().to_string(),
                                "attempt": attempt,
                                "successors": report.fan_out(),
                                "terminal": report.is_terminal(),
                            })),
                        )
                        .await;
                    Ok(())
                }
            })
            .instrument(span)
            .await
    }

    /// Runs one attempt: input validation, handler, output validation and
    /// dispatch.
    pub async fn run_once(
        &self,
        msg: &PipelineMessage,
        attempt: u32,
    ) -> Result<DispatchReport, NodeError> {
        let name = self.spec.name.as_str();
        let input = msg.payload().clone();

        if let Some(contract) = &self.spec.input_contract {
            contract.validate(name, Direction::Input, &input)?;
        }

        let ctx = NodeContext::new(
            name,
            msg.correlation_id(),
            msg.message_id(),
            msg.entity_refs().clone(),
            Arc::clone(&self.tasks),
        )
        .with_attempt(attempt);

        self.sink.try_emit(
            event_types::NODE_STARTED,
            Some(json!({
                "node": name,
                "correlation_id": msg.correlation_id().to_string(),
                "attempt": attempt,
            })),
        );

        let timer = SpanTimer::start();
        let call = self.spec.handler.handle(&ctx, input.clone());
        let output = match self.timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| NodeError::Timeout {
                    node: name.to_string(),
                    after,
                })??,
            None => call.await?,
        };
        debug!(node = name, attempt, duration_ms = timer.elapsed_ms(), "Handler finished");

        if let Some(contract) = &self.spec.output_contract {
            match &output {
                NodeOutput::Replace(payload) => {
                    contract.validate(name, Direction::Output, payload)?;
                }
                NodeOutput::Unchanged if self.dispatcher.graph().has_successors(name) => {
                    return Err(ContractViolation::single(
                        name,
                        Direction::Output,
                        contract.name(),
                        ValidationIssue::new(
                            "handler returned no output but the node declares an output contract",
                        ),
                    )
                    .into());
                }
                NodeOutput::Unchanged => {}
            }
        }

        let payload = output.into_payload(&input);
        self.dispatcher.dispatch(name, msg, payload).await
    }
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor")
            .field("node", &self.spec.name)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{node_queue, Broker, DeliveryStream, InMemoryBroker, RetryStamp};
    use crate::contracts::Schema;
    use crate::contracts::FieldKind;
    use crate::core::{DeadLetterRecord, EntityRefs, Payload, StepOutcome};
    use crate::errors::{ErrorKind, HandlerError};
    use crate::events::CollectingEventSink;
    use crate::middleware::JitterStrategy;
    use crate::nodes::{FnNode, NodeHandler, Passthrough};
    use crate::pipeline::{GraphBuilder, PipelineGraph};
    use crate::services::InMemoryTaskService;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        broker: Arc<InMemoryBroker>,
        tasks: Arc<InMemoryTaskService>,
        sink: Arc<CollectingEventSink>,
        executor: NodeExecutor,
    }

    /// Runs `spec` inside the chain `patient_created -> spec -> next`.
    fn harness(spec: NodeSpec, retry: RetryPolicy) -> Harness {
        let graph = GraphBuilder::new("exec")
            .node(spec.clone())
            .node(NodeSpec::new("next", Arc::new(Passthrough)))
            .on_event("patient_created", spec.name.clone())
            .then(spec.name.clone(), "next")
            .build()
            .unwrap();
        harness_in(graph, spec, retry)
    }

    fn harness_in(graph: PipelineGraph, spec: NodeSpec, retry: RetryPolicy) -> Harness {
        let graph = Arc::new(graph);
        let broker = Arc::new(InMemoryBroker::new());
        let sink = Arc::new(CollectingEventSink::new());
        let tasks = Arc::new(InMemoryTaskService::new());
        let dispatcher = Dispatcher::new(graph, broker.clone(), tasks.clone(), sink.clone(), "t");
        let dead_letters = DeadLetterPublisher::new(broker.clone(), "dlq", sink.clone());
        let executor = NodeExecutor::new(
            spec,
            dispatcher,
            dead_letters,
            tasks.clone(),
            sink.clone(),
            retry,
            None,
        );
        Harness {
            broker,
            tasks,
            sink,
            executor,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    async fn deliver(h: &Harness, body: Vec<u8>) -> DeliveryOutcome {
        h.broker.publish("in", body).await.unwrap();
        let mut stream = h.broker.consume("in", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        h.executor.handle_delivery(delivery).await
    }

    /// Handles redeliveries from `stream` until one is settled for good.
    async fn settle(h: &Harness, stream: &mut DeliveryStream) -> DeliveryOutcome {
        loop {
            let delivery = stream.next().await.unwrap().unwrap();
            let outcome = h.executor.handle_delivery(delivery).await;
            if outcome != DeliveryOutcome::RetryScheduled {
                return outcome;
            }
        }
    }

    async fn deliver_until_settled(h: &Harness, body: Vec<u8>) -> DeliveryOutcome {
        h.broker.publish("in", body).await.unwrap();
        let mut stream = h.broker.consume("in", 1).await.unwrap();
        settle(h, &mut stream).await
    }

    fn message(payload: serde_json::Value) -> Vec<u8> {
        let payload: Payload = serde_json::from_value(payload).unwrap();
        PipelineMessage::triggered("patient_created", EntityRefs::new(), payload)
            .to_bytes()
            .unwrap()
    }

    fn dead_letters(h: &Harness) -> Vec<DeadLetterRecord> {
        h.broker
            .drain("dlq")
            .iter()
            .map(|b| DeadLetterRecord::from_bytes(b).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_success_publishes_successor() {
        let h = harness(NodeSpec::new("anonymize", Arc::new(Passthrough)), fast_retry(3));

        let outcome = deliver(&h, message(json!({"pixel": 1}))).await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
        let bodies = h.broker.drain(&node_queue("t", "next"));
        assert_eq!(bodies.len(), 1);
        let next = PipelineMessage::from_bytes(&bodies[0]).unwrap();
        assert_eq!(next.visited(), vec!["patient_created", "anonymize"]);
        assert_eq!(next.history()[1].outcome, StepOutcome::Completed);
        assert_eq!(h.broker.pending_count("in"), 0);
        assert_eq!(h.sink.count_for_node(event_types::NODE_COMPLETED, "anonymize"), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_below_ceiling_converge() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = FnNode::new("flaky", move |_ctx: &NodeContext, payload: Payload| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(HandlerError::transient("gateway timeout"))
            } else {
                Ok(NodeOutput::Replace(payload))
            }
        });
        let h = harness(NodeSpec::new("flaky", Arc::new(handler)), fast_retry(3));

        let outcome = deliver_until_settled(&h, message(json!({}))).await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.broker.pending_count(&node_queue("t", "next")), 1);
        assert_eq!(h.sink.count(event_types::NODE_RETRY_SCHEDULED), 2);
    }

    #[tokio::test]
    async fn test_retry_exhausted_is_dead_lettered() {
        let handler = FnNode::new("down", |_ctx: &NodeContext, _payload: Payload| {
            Err(HandlerError::transient("still down"))
        });
        let h = harness(NodeSpec::new("down", Arc::new(handler)), fast_retry(2));

        let outcome = deliver_until_settled(&h, message(json!({}))).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered(ErrorKind::RetryExhausted));
        let records = dead_letters(&h);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt_count(), 2);
        assert!(records[0].error_detail().contains("still down"));
        assert_eq!(h.broker.pending_count("in"), 0);
    }

    #[tokio::test]
    async fn test_domain_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = FnNode::new("reject", move |_ctx: &NodeContext, _payload: Payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::new("study has no images"))
        });
        let h = harness(NodeSpec::new("reject", Arc::new(handler)), fast_retry(5));

        let outcome = deliver(&h, message(json!({}))).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered(ErrorKind::HandlerDomainError));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_output_contract_violation_dead_lettered_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = FnNode::new("birads", move |_ctx: &NodeContext, _payload: Payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(NodeOutput::field("birads", json!("four")))
        });
        let spec = NodeSpec::new("get_birads", Arc::new(handler))
            .with_output(Schema::new("birads_out").required("birads", FieldKind::Integer));
        let h = harness(spec, fast_retry(5));

        let outcome = deliver(&h, message(json!({}))).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered(ErrorKind::ContractViolation));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.broker.pending_count(&node_queue("t", "next")), 0);
        let records = dead_letters(&h);
        assert_eq!(records[0].failing_node(), "get_birads");
        assert_eq!(records[0].error_kind(), ErrorKind::ContractViolation);
    }

    #[tokio::test]
    async fn test_input_contract_violation() {
        let spec = NodeSpec::new("anonymize", Arc::new(Passthrough))
            .with_input(Schema::new("study").required("study_id", FieldKind::String));
        let h = harness(spec, fast_retry(5));

        let outcome = deliver(&h, message(json!({"other": 1}))).await;
        assert_eq!(outcome, DeliveryOutcome::DeadLettered(ErrorKind::ContractViolation));
    }

    #[tokio::test]
    async fn test_unchanged_with_output_contract_and_successor_is_violation() {
        let handler = FnNode::new("noop", |_ctx: &NodeContext, _payload: Payload| Ok(NodeOutput::Unchanged));
        let spec = NodeSpec::new("noop", Arc::new(handler))
            .with_output(Schema::new("noop_out").required("x", FieldKind::Integer));
        let h = harness(spec, fast_retry(5));

        let outcome = deliver(&h, message(json!({"x": 1}))).await;
        assert_eq!(outcome, DeliveryOutcome::DeadLettered(ErrorKind::ContractViolation));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let h = harness(NodeSpec::new("anonymize", Arc::new(Passthrough)), fast_retry(5));

        let outcome = deliver(&h, b"not json".to_vec()).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered(ErrorKind::MalformedMessage));
        let records = dead_letters(&h);
        assert_eq!(records[0].failing_node(), "anonymize");
        assert_eq!(records[0].original_message(), &json!("not json"));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        #[derive(Debug)]
        struct Slow;

        #[async_trait::async_trait]
        impl NodeHandler for Slow {
            async fn handle(&self, _ctx: &NodeContext, payload: Payload) -> Result<NodeOutput, HandlerError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(NodeOutput::Replace(payload))
            }
        }

        let spec = NodeSpec::new("slow", Arc::new(Slow)).with_timeout(Duration::from_millis(5));
        let h = harness(spec, fast_retry(2));

        let outcome = deliver_until_settled(&h, message(json!({}))).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered(ErrorKind::RetryExhausted));
        assert!(dead_letters(&h)[0].error_detail().contains("timed out"));
    }

    #[tokio::test]
    async fn test_dead_letter_failure_requeues() {
        let handler = FnNode::new("reject", |_ctx: &NodeContext, _payload: Payload| {
            Err(HandlerError::new("bad"))
        });
        let h = harness(NodeSpec::new("reject", Arc::new(handler)), fast_retry(1));
        h.broker.publish("in", message(json!({}))).await.unwrap();
        let mut stream = h.broker.consume("in", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        h.broker.fail_next_publishes(1);
        let outcome = h.executor.handle_delivery(delivery).await;

        assert_eq!(outcome, DeliveryOutcome::Requeued);
        assert_eq!(h.broker.pending_count("in"), 1);
    }

    #[tokio::test]
    async fn test_retry_releases_delivery_and_schedules_stamped_copy() {
        let handler = FnNode::new("flaky", |_ctx: &NodeContext, _payload: Payload| {
            Err(HandlerError::transient("gateway timeout"))
        });
        let retry = RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay_ms(50)
            .with_jitter(JitterStrategy::None);
        let h = harness(NodeSpec::new("flaky", Arc::new(handler)), retry);
        let body = message(json!({}));

        let outcome = deliver(&h, body.clone()).await;

        assert_eq!(outcome, DeliveryOutcome::RetryScheduled);
        assert_eq!(h.broker.pending_count("in"), 0);
        assert_eq!(h.broker.delayed_count(), 1);
        assert!(dead_letters(&h).is_empty());

        let mut stream = h.broker.consume("in", 1).await.unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();
        assert_eq!(redelivered.body, body);
        let stamp = redelivered.retry.unwrap();
        assert_eq!(stamp.attempts, 1);
        assert_eq!(h.broker.delayed_count(), 0);
    }

    #[tokio::test]
    async fn test_carried_attempts_count_toward_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = FnNode::new("down", move |ctx: &NodeContext, _payload: Payload| {
            counter.store(ctx.attempt(), Ordering::SeqCst);
            Err(HandlerError::transient("still down"))
        });
        let h = harness(NodeSpec::new("down", Arc::new(handler)), fast_retry(3));
        let first_failed_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        let stamp = RetryStamp {
            attempts: 2,
            first_failed_at,
        };
        h.broker
            .publish_delayed("in", message(json!({})), stamp, Duration::ZERO)
            .await
            .unwrap();
        let mut stream = h.broker.consume("in", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        let outcome = h.executor.handle_delivery(delivery).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered(ErrorKind::RetryExhausted));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let records = dead_letters(&h);
        assert_eq!(records[0].attempt_count(), 3);
        assert_eq!(records[0].first_failed_at(), first_failed_at);
    }

    #[tokio::test]
    async fn test_retried_fan_out_opens_checkpoint_task_once() {
        let spec = NodeSpec::new("a", Arc::new(Passthrough));
        let graph = GraphBuilder::new("fan")
            .node(spec.clone())
            .node(NodeSpec::new("b", Arc::new(Passthrough)))
            .checkpoint("review", "review_task")
            .on_event("patient_created", "a")
            .then("a", ["review", "b"])
            .build()
            .unwrap();
        let h = harness_in(graph, spec, fast_retry(3));
        h.broker.publish("in", message(json!({}))).await.unwrap();
        let mut stream = h.broker.consume("in", 1).await.unwrap();

        // The checkpoint is reached before the publish to `b` fails.
        h.broker.fail_next_publishes(1);
        let outcome = settle(&h, &mut stream).await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(h.tasks.tasks_of_type("review_task").len(), 1);
        assert_eq!(h.broker.pending_count(&node_queue("t", "b")), 1);
    }

    #[tokio::test]
    async fn test_unchanged_without_output_contract_forwards_input() {
        let handler = FnNode::new("noop", |_ctx: &NodeContext, _payload: Payload| Ok(NodeOutput::Unchanged));
        let h = harness(NodeSpec::new("noop", Arc::new(handler)), fast_retry(1));

        let outcome = deliver(&h, message(json!({"study_id": "s-1", "views": 4}))).await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
        let bodies = h.broker.drain(&node_queue("t", "next"));
        let next = PipelineMessage::from_bytes(&bodies[0]).unwrap();
        assert_eq!(next.payload().get("study_id"), Some(&json!("s-1")));
        assert_eq!(next.payload().get("views"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_unchanged_with_output_contract_at_terminal_node_is_accepted() {
        let handler = FnNode::new("noop", |_ctx: &NodeContext, _payload: Payload| Ok(NodeOutput::Unchanged));
        let spec = NodeSpec::new("noop", Arc::new(handler))
            .with_output(Schema::new("noop_out").required("x", FieldKind::Integer));
        let graph = GraphBuilder::new("leaf")
            .node(spec.clone())
            .on_event("patient_created", "noop")
            .build()
            .unwrap();
        let h = harness_in(graph, spec, fast_retry(1));

        let outcome = deliver(&h, message(json!({}))).await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert!(dead_letters(&h).is_empty());
        assert_eq!(h.sink.count(event_types::BRANCH_TERMINAL), 1);
    }
}
