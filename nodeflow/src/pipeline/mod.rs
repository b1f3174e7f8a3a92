//! Pipeline graph declaration.
//!
//! This module provides:
//! - Node, edge and trigger specifications
//! - The graph builder with validation
//! - The immutable [`PipelineGraph`] workers run against
//! - Loading graphs from TOML definition files

mod builder;
mod definition;
mod graph;
mod spec;

pub use builder::GraphBuilder;
pub use definition::{
    load_graph, CheckpointDef, ConditionDef, DefinitionError, EdgeDef, GraphDefinition, NodeDef,
    TriggerDef,
};
pub use graph::PipelineGraph;
pub use spec::{
    Branch, BranchMode, CheckpointSpec, Condition, Edge, Node, NodeSpec, Successors, Trigger,
    TriggerBinding,
};
