//! Node, edge and trigger specifications.

use crate::contracts::PayloadContract;
use crate::core::{LifecycleEvent, Payload};
use crate::nodes::NodeHandler;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Specification of an executable node.
#[derive(Clone)]
pub struct NodeSpec {
    /// The node name, also its queue name suffix.
    pub name: String,
    /// The handler run for every delivery.
    pub handler: Arc<dyn NodeHandler>,
    /// Contract checked before the handler runs.
    pub input_contract: Option<Arc<dyn PayloadContract>>,
    /// Contract checked on the handler output.
    pub output_contract: Option<Arc<dyn PayloadContract>>,
    /// Handler timeout; falls back to the worker default.
    pub timeout: Option<Duration>,
    /// Capabilities a worker must have to consume this node.
    pub requires: BTreeSet<String>,
    /// Declared concurrency. A per-node worker setting wins over it; the
    /// worker default applies when neither is set.
    pub concurrency: Option<usize>,
}

impl NodeSpec {
    /// Creates a node with no contracts or requirements.
    #[must_use]
    pub fn new(name: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            input_contract: None,
            output_contract: None,
            timeout: None,
            requires: BTreeSet::new(),
            concurrency: None,
        }
    }

    /// Sets the input contract.
    #[must_use]
    pub fn with_input(mut self, contract: impl PayloadContract + 'static) -> Self {
        self.input_contract = Some(Arc::new(contract));
        self
    }

    /// Sets the output contract.
    #[must_use]
    pub fn with_output(mut self, contract: impl PayloadContract + 'static) -> Self {
        self.output_contract = Some(Arc::new(contract));
        self
    }

    /// Sets the handler timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a required capability (e.g. `gpu`).
    #[must_use]
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.requires.insert(capability.into());
        self
    }

    /// Sets the declared concurrency.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("handler", &self.handler)
            .field("input_contract", &self.input_contract.as_ref().map(|c| c.name().to_string()))
            .field("output_contract", &self.output_contract.as_ref().map(|c| c.name().to_string()))
            .field("timeout", &self.timeout)
            .field("requires", &self.requires)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// A human checkpoint: runs no code, opens a task and parks the branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSpec {
    /// The checkpoint name.
    pub name: String,
    /// Task type opened in the task service.
    pub task_type: String,
}

/// A node of the graph.
#[derive(Debug, Clone)]
pub enum Node {
    /// Runs a handler on a worker.
    Executable(NodeSpec),
    /// Parks the branch until a completion trigger.
    Checkpoint(CheckpointSpec),
}

impl Node {
    /// Returns the node name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Executable(spec) => &spec.name,
            Self::Checkpoint(cp) => &cp.name,
        }
    }

    /// Returns true for checkpoints.
    #[must_use]
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Self::Checkpoint(_))
    }

    /// Returns the executable spec, if any.
    #[must_use]
    pub fn as_executable(&self) -> Option<&NodeSpec> {
        match self {
            Self::Executable(spec) => Some(spec),
            Self::Checkpoint(_) => None,
        }
    }
}

/// Predicate evaluated on a node's validated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// `payload[field] == value`. A missing field never matches.
    FieldEquals {
        /// The field tested.
        field: String,
        /// The expected value.
        value: serde_json::Value,
    },
}

impl Condition {
    /// Creates a field-equality condition.
    #[must_use]
    pub fn field_equals(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Returns the field the condition tests.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::FieldEquals { field, .. } => field,
        }
    }

    /// Evaluates the condition.
    #[must_use]
    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            Self::FieldEquals { field, value } => payload.get(field) == Some(value),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldEquals { field, value } => write!(f, "{field} == {value}"),
        }
    }
}

/// How a matching conditional edge interacts with the node's other
/// conditional edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchMode {
    /// Every matching edge fires.
    #[default]
    Inclusive,
    /// When this edge matches, later conditional edges of the node are skipped.
    Exclusive,
}

/// An outgoing edge of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Edge {
    /// Always fires to one successor.
    Direct(String),
    /// Always fires to every listed successor.
    FanOut(Vec<String>),
    /// Fires when the condition holds on the node's output.
    Conditional {
        /// The predicate.
        condition: Condition,
        /// The successor.
        target: String,
        /// Exclusivity.
        mode: BranchMode,
    },
}

impl Edge {
    /// Returns the successor names this edge may fire to.
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Direct(target) | Self::Conditional { target, .. } => vec![target.as_str()],
            Self::FanOut(targets) => targets.iter().map(String::as_str).collect(),
        }
    }
}

/// A conditional successor for [`GraphBuilder::then`](super::GraphBuilder::then).
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    condition: Condition,
    target: String,
    mode: BranchMode,
}

impl Branch {
    /// Fires `target` when `condition` holds.
    #[must_use]
    pub fn when(condition: Condition, target: impl Into<String>) -> Self {
        Self {
            condition,
            target: target.into(),
            mode: BranchMode::Inclusive,
        }
    }

    /// Makes the branch exclusive.
    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.mode = BranchMode::Exclusive;
        self
    }
}

/// Anything that can follow a node: a name, a fan-out set or a [`Branch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Successors(pub(crate) Edge);

impl From<&str> for Successors {
    fn from(target: &str) -> Self {
        Self(Edge::Direct(target.to_string()))
    }
}

impl From<String> for Successors {
    fn from(target: String) -> Self {
        Self(Edge::Direct(target))
    }
}

impl<const N: usize> From<[&str; N]> for Successors {
    fn from(targets: [&str; N]) -> Self {
        Self(Edge::FanOut(targets.iter().map(|t| (*t).to_string()).collect()))
    }
}

impl From<Vec<&str>> for Successors {
    fn from(targets: Vec<&str>) -> Self {
        Self(Edge::FanOut(targets.into_iter().map(str::to_string).collect()))
    }
}

impl From<Vec<String>> for Successors {
    fn from(targets: Vec<String>) -> Self {
        Self(Edge::FanOut(targets))
    }
}

impl From<Branch> for Successors {
    fn from(branch: Branch) -> Self {
        Self(Edge::Conditional {
            condition: branch.condition,
            target: branch.target,
            mode: branch.mode,
        })
    }
}

/// What starts (or resumes) traversal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// A lifecycle event by name, optionally filtered on status.
    Event {
        /// Event name, e.g. `patient_created`.
        name: String,
        /// Required status, if any.
        status: Option<String>,
    },
    /// The task opened by a checkpoint was finished.
    Finished(String),
}

impl Trigger {
    /// Creates an event trigger.
    #[must_use]
    pub fn event(name: impl Into<String>) -> Self {
        Self::Event {
            name: name.into(),
            status: None,
        }
    }

    /// Returns true if an event trigger matches the event.
    ///
    /// Completion triggers are matched by task type in the graph instead.
    #[must_use]
    pub fn matches(&self, event: &LifecycleEvent) -> bool {
        match self {
            Self::Event { name, status } => {
                *name == event.name()
                    && status.as_deref().map_or(true, |s| event.status() == Some(s))
            }
            Self::Finished(_) => false,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event { name, status: None } => write!(f, "{name}"),
            Self::Event {
                name,
                status: Some(status),
            } => write!(f, "{name}[{status}]"),
            Self::Finished(checkpoint) => write!(f, "finished({checkpoint})"),
        }
    }
}

/// A trigger bound to the node traversal starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerBinding {
    /// The trigger.
    pub trigger: Trigger,
    /// The entry node; for completion triggers, the checkpoint itself.
    pub entry: String,
}
