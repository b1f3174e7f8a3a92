//! Node handlers.
//!
//! Nodes are the units of work a pipeline graph connects. The engine treats
//! a handler as an opaque function from a validated payload to a
//! [`NodeOutput`]; everything around it (contracts, retry, dispatch) is done
//! by the worker.

mod builtin;
mod registry;

pub use builtin::{CompareFields, CreateRecord, Passthrough, SetFields};
pub use registry::{HandlerFactory, HandlerRegistry, RegistryError};

use crate::core::{EntityRefs, NodeOutput, Payload};
use crate::errors::HandlerError;
use crate::services::TaskService;
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// What a handler can see about the delivery it is processing.
#[derive(Clone)]
pub struct NodeContext {
    node: String,
    correlation_id: Uuid,
    message_id: Uuid,
    entity_refs: EntityRefs,
    attempt: u32,
    services: Arc<dyn TaskService>,
}

impl NodeContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        node: impl Into<String>,
        correlation_id: Uuid,
        message_id: Uuid,
        entity_refs: EntityRefs,
        services: Arc<dyn TaskService>,
    ) -> Self {
        Self {
            node: node.into(),
            correlation_id,
            message_id,
            entity_refs,
            attempt: 1,
            services,
        }
    }

    /// Sets the 1-based attempt number.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Returns the node name.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Returns the run's correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Returns the id of the message being processed.
    #[must_use]
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Returns the entity refs.
    #[must_use]
    pub fn entity_refs(&self) -> &EntityRefs {
        &self.entity_refs
    }

    /// Returns the 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the persistence/task service.
    #[must_use]
    pub fn services(&self) -> &Arc<dyn TaskService> {
        &self.services
    }
}

impl Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node)
            .field("correlation_id", &self.correlation_id)
            .field("message_id", &self.message_id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Trait for node handlers.
///
/// Handlers run at least once per message and must be idempotent.
#[async_trait]
pub trait NodeHandler: Send + Sync + Debug {
    /// Processes a payload that already passed the node's input contract.
    async fn handle(&self, ctx: &NodeContext, payload: Payload) -> Result<NodeOutput, HandlerError>;
}

/// A handler built from a synchronous function.
pub struct FnNode<F>
where
    F: Fn(&NodeContext, Payload) -> Result<NodeOutput, HandlerError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnNode<F>
where
    F: Fn(&NodeContext, Payload) -> Result<NodeOutput, HandlerError> + Send + Sync,
{
    /// Creates a function-based handler. `name` is only used for debugging.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnNode<F>
where
    F: Fn(&NodeContext, Payload) -> Result<NodeOutput, HandlerError> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnNode").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> NodeHandler for FnNode<F>
where
    F: Fn(&NodeContext, Payload) -> Result<NodeOutput, HandlerError> + Send + Sync,
{
    async fn handle(&self, ctx: &NodeContext, payload: Payload) -> Result<NodeOutput, HandlerError> {
        (self.func)(ctx, payload)
    }
}

/// A handler built from an async function.
///
/// The function receives an owned copy of the context so the returned
/// future does not borrow from the worker.
pub struct AsyncFnNode<F, Fut>
where
    F: Fn(NodeContext, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput, HandlerError>> + Send,
{
    name: String,
    func: F,
    _phantom: std::marker::PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnNode<F, Fut>
where
    F: Fn(NodeContext, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput, HandlerError>> + Send,
{
    /// Creates an async function-based handler.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnNode<F, Fut>
where
    F: Fn(NodeContext, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput, HandlerError>> + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFnNode").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> NodeHandler for AsyncFnNode<F, Fut>
where
    F: Fn(NodeContext, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput, HandlerError>> + Send,
{
    async fn handle(&self, ctx: &NodeContext, payload: Payload) -> Result<NodeOutput, HandlerError> {
        (self.func)(ctx.clone(), payload).await
    }
}

#[cfg(test)]
pub(crate) fn test_context(node: &str) -> NodeContext {
    NodeContext::new(
        node,
        Uuid::new_v4(),
        Uuid::new_v4(),
        EntityRefs::new(),
        Arc::new(crate::services::InMemoryTaskService::new()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fn_node() {
        let node = FnNode::new("double", |_ctx, payload| {
            let n = payload.get("n").and_then(serde_json::Value::as_i64).unwrap_or(0);
            Ok(NodeOutput::field("n", json!(n * 2)))
        });

        let mut payload = Payload::new();
        payload.insert("n".to_string(), json!(21));

        let output = node.handle(&test_context("double"), payload).await.unwrap();
        assert_eq!(output, NodeOutput::field("n", json!(42)));
    }

    #[tokio::test]
    async fn test_async_fn_node_sees_context() {
        let node = AsyncFnNode::new("echo_attempt", |ctx: NodeContext, _payload| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(NodeOutput::field("attempt", json!(ctx.attempt())))
        });

        let ctx = test_context("echo_attempt").with_attempt(3);
        let output = node.handle(&ctx, Payload::new()).await.unwrap();
        assert_eq!(output, NodeOutput::field("attempt", json!(3)));
    }

    #[test]
    fn test_context_debug_omits_services() {
        let rendered = format!("{:?}", test_context("anonymize"));
        assert!(rendered.contains("anonymize"));
        assert!(!rendered.contains("InMemoryTaskService"));
    }
}
