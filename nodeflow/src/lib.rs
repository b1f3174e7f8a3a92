//! # Nodeflow
//!
//! Declarative pipeline graphs executed by broker-driven workers.
//!
//! A pipeline is a directed acyclic graph of named nodes. Lifecycle events
//! (a patient was created, a task was finished) start or resume runs; each
//! node consumes messages from its own queue, runs a handler, validates the
//! result against its contract and publishes to its successors. Nodeflow
//! provides:
//!
//! - **Graph builder**: fan-out, conditional edges and human checkpoints,
//!   validated once at startup
//! - **Payload contracts**: structural schemas checked before and after
//!   every handler
//! - **Retry and dead-lettering**: transient failures are retried with
//!   backoff, permanent ones end in a dead-letter record
//! - **Worker runtime**: prefetch-bounded consumers with graceful shutdown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nodeflow::prelude::*;
//!
//! let graph = GraphBuilder::new("mammography")
//!     .node(NodeSpec::new("anonymize", Arc::new(Anonymize)))
//!     .node(NodeSpec::new("get_birads", Arc::new(Birads)))
//!     .checkpoint("quality_check", "quality_check")
//!     .on_event("patient_created", "anonymize")
//!     .then("anonymize", ["quality_check", "get_birads"])
//!     .build()?;
//!
//! let broker = nodeflow::broker::connect(&settings.broker_url).await?;
//! WorkerRuntime::new(Arc::new(graph), broker, tasks, settings).run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod broker;
pub mod cancellation;
pub mod config;
pub mod contracts;
pub mod core;
pub mod errors;
pub mod events;
pub mod middleware;
pub mod nodes;
pub mod observability;
pub mod pipeline;
pub mod runtime;
pub mod services;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::{Broker, InMemoryBroker};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::Settings;
    pub use crate::contracts::{FieldKind, PayloadContract, Schema, TypedContract};
    pub use crate::core::{
        DeadLetterRecord, EntityRefs, LifecycleEvent, NodeOutput, Payload, PipelineMessage,
        StepOutcome,
    };
    pub use crate::errors::{
        BuildError, ContractErrorInfo, ErrorKind, HandlerError, NodeError, NodeflowError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::middleware::RetryPolicy;
    pub use crate::nodes::{AsyncFnNode, FnNode, HandlerRegistry, NodeContext, NodeHandler};
    pub use crate::pipeline::{Branch, Condition, GraphBuilder, NodeSpec, PipelineGraph};
    pub use crate::runtime::WorkerRuntime;
    pub use crate::services::{InMemoryTaskService, TaskService};
    pub use std::sync::Arc;
}
