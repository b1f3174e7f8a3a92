//! Runtime events for observability.
//!
//! Every delivery produces a trail of events through an injected
//! [`EventSink`]: what started, what completed, what was retried, parked or
//! dead-lettered.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the runtime.
pub mod event_types {
    /// A handler attempt started.
    pub const NODE_STARTED: &str = "node.started";
    /// A node ran and its successors were dispatched.
    pub const NODE_COMPLETED: &str = "node.completed";
    /// A transient failure will be retried.
    pub const NODE_RETRY_SCHEDULED: &str = "node.retry_scheduled";
    /// A delivery was dead-lettered.
    pub const NODE_DEAD_LETTERED: &str = "node.dead_lettered";
    /// A branch reached a node without successors.
    pub const BRANCH_TERMINAL: &str = "branch.terminal";
    /// A branch was handed to the task service at a checkpoint.
    pub const BRANCH_PARKED: &str = "branch.parked";
    /// A trigger started or resumed a run.
    pub const TRIGGER_FIRED: &str = "trigger.fired";
    /// A lifecycle event matched no trigger.
    pub const TRIGGER_UNMATCHED: &str = "trigger.unmatched";
}
