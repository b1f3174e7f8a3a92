//! Core data model for nodeflow.
//!
//! This module contains the types that travel over the broker:
//! - Pipeline messages and their step history
//! - Node outputs
//! - Lifecycle events that fire triggers
//! - Dead-letter records

mod dead_letter;
mod event;
mod message;
mod output;

pub use dead_letter::DeadLetterRecord;
pub use event::LifecycleEvent;
pub use message::{EntityRefs, Payload, PipelineMessage, StepOutcome, StepRecord};
pub use output::NodeOutput;
