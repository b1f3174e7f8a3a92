//! Error types for the nodeflow engine.
//!
//! Errors fall in two groups. [`BuildError`] is raised while a graph is
//! declared and aborts worker startup. Everything raised while a delivery is
//! processed is folded into [`NodeError`], which the retry middleware
//! classifies as transient or permanent through [`NodeError::is_transient`].

use crate::contracts::ContractViolation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for nodeflow operations outside of node execution.
#[derive(Debug, Error)]
pub enum NodeflowError {
    /// The graph could not be built.
    #[error("{0}")]
    Build(#[from] BuildError),

    /// A graph definition file could not be loaded.
    #[error("{0}")]
    Definition(#[from] crate::pipeline::DefinitionError),

    /// Settings could not be loaded.
    #[error("{0}")]
    Config(#[from] crate::config::ConfigError),

    /// The broker failed.
    #[error("{0}")]
    Broker(#[from] BrokerError),

    /// The persistence/task service failed.
    #[error("{0}")]
    Service(#[from] ServiceError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Metadata about a graph error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-004-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Stable codes attached to [`BuildError`]s.
pub mod codes {
    /// The graph declares no nodes.
    pub const EMPTY: &str = "GRAPH-001-EMPTY";
    /// Two nodes share a name.
    pub const DUPLICATE: &str = "GRAPH-002-DUPLICATE";
    /// An edge or trigger references an undeclared node.
    pub const MISSING_NODE: &str = "GRAPH-003-MISSING_NODE";
    /// The graph contains a cycle.
    pub const CYCLE: &str = "GRAPH-004-CYCLE";
    /// A fan-out set is malformed.
    pub const FAN_OUT: &str = "GRAPH-005-FAN_OUT";
    /// A condition tests a field the output contract does not declare.
    pub const CONDITION_FIELD: &str = "GRAPH-006-CONDITION_FIELD";
}

/// Error raised when a pipeline graph fails validation.
///
/// A graph that raises this never reaches a worker: the runtime refuses to
/// start rather than fail lazily mid-stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BuildError {
    /// The error message.
    pub message: String,
    /// The nodes involved in the error.
    pub nodes: Vec<String>,
    /// Structured diagnostics.
    pub error_info: ContractErrorInfo,
}

impl BuildError {
    fn new(message: String, nodes: Vec<String>, error_info: ContractErrorInfo) -> Self {
        Self {
            message,
            nodes,
            error_info,
        }
    }

    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.error_info.code
    }

    /// The graph has no nodes.
    #[must_use]
    pub fn empty(graph: &str) -> Self {
        Self::new(
            format!("Graph '{graph}' has no nodes"),
            Vec::new(),
            ContractErrorInfo::new(codes::EMPTY, "Cannot build an empty graph")
                .with_fix_hint("Declare at least one node before building."),
        )
    }

    /// A node name was declared twice.
    #[must_use]
    pub fn duplicate_node(name: &str) -> Self {
        Self::new(
            format!("Node '{name}' is declared more than once"),
            vec![name.to_string()],
            ContractErrorInfo::new(codes::DUPLICATE, format!("Duplicate node '{name}'"))
                .with_fix_hint("Node and checkpoint names share one namespace; rename one of them."),
        )
    }

    /// An edge or trigger references a node that was never declared.
    #[must_use]
    pub fn missing_node(referrer: &str, name: &str) -> Self {
        Self::new(
            format!("{referrer} references unknown node '{name}'"),
            vec![name.to_string()],
            ContractErrorInfo::new(codes::MISSING_NODE, format!("Node '{name}' not found"))
                .with_context("referrer", serde_json::json!(referrer))
                .with_fix_hint("Declare the node before building, and check for typos."),
        )
    }

    /// A fan-out set has fewer than two targets or repeats a target.
    #[must_use]
    pub fn invalid_fan_out(from: &str, targets: &[String], reason: &str) -> Self {
        let mut nodes = vec![from.to_string()];
        nodes.extend(targets.iter().cloned());
        Self::new(
            format!("Fan-out from '{from}' is invalid: {reason}"),
            nodes,
            ContractErrorInfo::new(codes::FAN_OUT, reason.to_string())
                .with_fix_hint("Use a direct edge for one successor and distinct names for a fan-out."),
        )
    }

    /// A conditional edge tests a field absent from the node's output schema.
    #[must_use]
    pub fn unknown_condition_field(node: &str, field: &str) -> Self {
        Self::new(
            format!("Condition on '{node}' tests field '{field}' which its output contract does not declare"),
            vec![node.to_string()],
            ContractErrorInfo::new(
                codes::CONDITION_FIELD,
                format!("Field '{field}' is not produced by '{node}'"),
            )
            .with_context("field", serde_json::json!(field)),
        )
    }

    /// The graph contains a cycle.
    #[must_use]
    pub fn cycle(path: Vec<String>) -> Self {
        let rendered = path.join(" -> ");
        Self::new(
            format!("Cycle detected in graph: {rendered}"),
            path,
            ContractErrorInfo::new(codes::CYCLE, format!("Graph contains a cycle: {rendered}"))
                .with_fix_hint("Remove one of the edges in the cycle; workers cannot detect loops at runtime."),
        )
    }
}

/// Errors raised by a broker implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// A publish was not confirmed.
    #[error("Publish to '{routing_key}' failed: {reason}")]
    Publish {
        /// The routing key.
        routing_key: String,
        /// The reason for failure.
        reason: String,
    },

    /// Acknowledging a delivery failed.
    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    /// The broker URL scheme is not supported by this build.
    #[error("Unsupported broker URL '{0}'")]
    UnsupportedUrl(String),

    /// The broker was closed.
    #[error("Broker is closed")]
    Closed,
}

impl BrokerError {
    /// Creates a publish error.
    #[must_use]
    pub fn publish(routing_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Publish {
            routing_key: routing_key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the persistence/task service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The service is unreachable or overloaded. Retried.
    #[error("Task service unavailable: {0}")]
    Unavailable(String),

    /// The service refused the request. Not retried.
    #[error("Task service rejected request: {0}")]
    Rejected(String),
}

/// Error returned by a node handler.
///
/// Handler errors are domain errors and permanent by default; a handler may
/// opt a specific failure into retry with [`HandlerError::transient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    /// The error message.
    pub message: String,
    /// Whether the error should be retried.
    pub transient: bool,
}

impl HandlerError {
    /// Creates a permanent domain error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    /// Creates an error that the retry middleware will retry.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }
}

impl From<ServiceError> for HandlerError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(_) => Self::transient(err.to_string()),
            ServiceError::Rejected(_) => Self::new(err.to_string()),
        }
    }
}

/// Classification recorded on a dead-letter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Input or output payload did not satisfy the node's contract.
    ContractViolation,
    /// Broker, network or timeout failure.
    TransientDeliveryError,
    /// The handler raised a domain error.
    HandlerDomainError,
    /// A transient failure persisted past the retry ceiling.
    RetryExhausted,
    /// The delivery body was not a pipeline message.
    MalformedMessage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContractViolation => write!(f, "ContractViolation"),
            Self::TransientDeliveryError => write!(f, "TransientDeliveryError"),
            Self::HandlerDomainError => write!(f, "HandlerDomainError"),
            Self::RetryExhausted => write!(f, "RetryExhausted"),
            Self::MalformedMessage => write!(f, "MalformedMessage"),
        }
    }
}

/// Failure of one execution unit (validation, handler, dispatch).
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// Contract violation on input or output.
    #[error("{0}")]
    Contract(#[from] ContractViolation),

    /// The handler failed.
    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// The handler did not finish within the node timeout.
    #[error("Node '{node}' timed out after {}ms", after.as_millis())]
    Timeout {
        /// The node name.
        node: String,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// Publishing a successor message failed.
    #[error("{0}")]
    Broker(#[from] BrokerError),

    /// The task service failed while parking at a checkpoint.
    #[error("{0}")]
    Service(#[from] ServiceError),
}

impl NodeError {
    /// Returns true if the failure should be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Contract(_) => false,
            Self::Handler(err) => err.transient,
            Self::Timeout { .. } | Self::Broker(_) => true,
            Self::Service(err) => matches!(err, ServiceError::Unavailable(_)),
        }
    }

    /// Returns the dead-letter classification of this failure.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Contract(_) => ErrorKind::ContractViolation,
            Self::Handler(err) if !err.transient => ErrorKind::HandlerDomainError,
            Self::Service(ServiceError::Rejected(_)) => ErrorKind::HandlerDomainError,
            _ => ErrorKind::TransientDeliveryError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context("node", serde_json::json!("anonymize"));

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.summary, "Test error");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("node"), Some(&serde_json::json!("anonymize")));
    }

    #[test]
    fn test_cycle_error() {
        let err = BuildError::cycle(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.code(), codes::CYCLE);
        assert_eq!(err.nodes.len(), 4);
    }

    #[test]
    fn test_missing_node_error() {
        let err = BuildError::missing_node("Edge from 'a'", "ghost");
        assert_eq!(err.code(), codes::MISSING_NODE);
        assert_eq!(err.nodes, vec!["ghost".to_string()]);
        assert_eq!(
            err.error_info.context.get("referrer"),
            Some(&serde_json::json!("Edge from 'a'"))
        );
    }

    #[test]
    fn test_node_error_classification() {
        let timeout = NodeError::Timeout {
            node: "slow".to_string(),
            after: Duration::from_millis(10),
        };
        assert!(timeout.is_transient());
        assert_eq!(timeout.kind(), ErrorKind::TransientDeliveryError);

        let domain = NodeError::from(HandlerError::new("bad input"));
        assert!(!domain.is_transient());
        assert_eq!(domain.kind(), ErrorKind::HandlerDomainError);

        let opted_in = NodeError::from(HandlerError::transient("gpu busy"));
        assert!(opted_in.is_transient());

        let rejected = NodeError::from(ServiceError::Rejected("409".to_string()));
        assert!(!rejected.is_transient());
        assert_eq!(rejected.kind(), ErrorKind::HandlerDomainError);

        let broker = NodeError::from(BrokerError::publish("q", "channel closed"));
        assert!(broker.is_transient());
    }

    #[test]
    fn test_service_error_into_handler_error() {
        let err: HandlerError = ServiceError::Unavailable("503".to_string()).into();
        assert!(err.transient);

        let err: HandlerError = ServiceError::Rejected("400".to_string()).into();
        assert!(!err.transient);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::ContractViolation.to_string(), "ContractViolation");
        assert_eq!(ErrorKind::RetryExhausted.to_string(), "RetryExhausted");
    }
}
