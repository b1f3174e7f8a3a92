//! Mock handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::core::{NodeOutput, Payload};
use crate::errors::HandlerError;
use crate::nodes::{NodeContext, NodeHandler};

/// One recorded handler call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Node the handler ran for.
    pub node: String,
    /// Correlation id of the run.
    pub correlation_id: Uuid,
    /// Attempt number.
    pub attempt: u32,
    /// Payload the handler received.
    pub payload: Payload,
}

/// A handler that records its calls and returns a configurable output.
///
/// Forwards its input unchanged until [`RecordingHandler::with_output`] is
/// used.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    output: Mutex<Option<NodeOutput>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingHandler {
    /// Creates a passthrough recording handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the output returned by every call.
    #[must_use]
    pub fn with_output(self, output: NodeOutput) -> Self {
        *self.output.lock() = Some(output);
        self
    }

    /// Returns a replacement payload holding a single field.
    #[must_use]
    pub fn returning_field(self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.with_output(NodeOutput::field(key, value))
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl NodeHandler for RecordingHandler {
    async fn handle(&self, ctx: &NodeContext, payload: Payload) -> Result<NodeOutput, HandlerError> {
        self.calls.lock().push(RecordedCall {
            node: ctx.node().to_string(),
            correlation_id: ctx.correlation_id(),
            attempt: ctx.attempt(),
            payload: payload.clone(),
        });
        Ok(self
            .output
            .lock()
            .clone()
            .unwrap_or(NodeOutput::Replace(payload)))
    }
}

/// A handler that fails transiently a fixed number of times, then forwards
/// its input.
#[derive(Debug)]
pub struct FlakyHandler {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyHandler {
    /// Creates a handler failing its first `failures` calls.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeHandler for FlakyHandler {
    async fn handle(&self, ctx: &NodeContext, payload: Payload) -> Result<NodeOutput, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(HandlerError::transient(format!(
                "{} unavailable (call {})",
                ctx.node(),
                call + 1
            )));
        }
        Ok(NodeOutput::Replace(payload))
    }
}

/// A handler that always fails.
#[derive(Debug)]
pub struct FailingHandler {
    error: HandlerError,
    calls: AtomicUsize,
}

impl FailingHandler {
    /// Creates a handler failing with a permanent domain error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            error: HandlerError::new(message),
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a handler failing with a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            error: HandlerError::transient(message),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeHandler for FailingHandler {
    async fn handle(&self, _ctx: &NodeContext, _payload: Payload) -> Result<NodeOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// A handler that sleeps before forwarding its input.
#[derive(Debug)]
pub struct SlowHandler {
    delay: Duration,
}

impl SlowHandler {
    /// Creates a handler sleeping `delay` per call.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl NodeHandler for SlowHandler {
    async fn handle(&self, _ctx: &NodeContext, payload: Payload) -> Result<NodeOutput, HandlerError> {
        tokio::time::sleep(self.delay).await;
        Ok(NodeOutput::Replace(payload))
    }
}
