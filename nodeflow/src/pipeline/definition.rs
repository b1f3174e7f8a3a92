//! Loading graphs from TOML definition files.
//!
//! ```toml
//! name = "mammography"
//!
//! [[triggers]]
//! event = "patient_created"
//! entry = "anonymize"
//!
//! [[nodes]]
//! name = "compare_ai_with_doctor"
//! handler = "compare_fields"
//! params = { left = "ai_mask", right = "doctor_mask" }
//! output = { result = "boolean" }
//!
//! [[checkpoints]]
//! name = "check_differences"
//!
//! [[edges]]
//! from = "compare_ai_with_doctor"
//! to = "check_differences"
//! when = { field = "result", equals = false }
//! ```

use super::builder::GraphBuilder;
use super::graph::PipelineGraph;
use super::spec::{Branch, Condition, NodeSpec, Successors};
use crate::contracts::{FieldSpec, Schema};
use crate::errors::BuildError;
use crate::nodes::{HandlerRegistry, RegistryError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading a graph definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for a graph definition.
    #[error("invalid graph definition: {0}")]
    Parse(#[from] toml::de::Error),

    /// A node's handler could not be resolved.
    #[error("node '{node}': {source}")]
    Handler {
        /// The node name.
        node: String,
        /// The registry error.
        source: RegistryError,
    },

    /// A schema field uses an unknown kind.
    #[error("node '{node}': field '{field}': {reason}")]
    InvalidSchema {
        /// The node name.
        node: String,
        /// The field name.
        field: String,
        /// Why the kind was rejected.
        reason: String,
    },

    /// An edge declaration is malformed.
    #[error("edge from '{from}': {reason}")]
    InvalidEdge {
        /// The source node.
        from: String,
        /// What is wrong.
        reason: String,
    },

    /// The declared graph failed validation.
    #[error("{0}")]
    Build(#[from] BuildError),
}

/// A graph definition as written in a file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDefinition {
    /// Graph name.
    pub name: String,
    /// Event triggers.
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
    /// Executable nodes.
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    /// Human checkpoints.
    #[serde(default)]
    pub checkpoints: Vec<CheckpointDef>,
    /// Edges.
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

/// `[[triggers]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerDef {
    /// Event name.
    pub event: String,
    /// Optional status filter.
    #[serde(default)]
    pub status: Option<String>,
    /// Entry node.
    pub entry: String,
}

/// `[[nodes]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDef {
    /// Node name.
    pub name: String,
    /// Registered handler name.
    pub handler: String,
    /// Handler params.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Input schema: field name to kind (`"string"`, `"int?"`, ...).
    #[serde(default)]
    pub input: Option<BTreeMap<String, String>>,
    /// Output schema.
    #[serde(default)]
    pub output: Option<BTreeMap<String, String>>,
    /// Reject output fields not in the output schema.
    #[serde(default)]
    pub strict_output: bool,
    /// Handler timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Required worker capabilities.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Concurrency override.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

/// `[[checkpoints]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointDef {
    /// Checkpoint name.
    pub name: String,
    /// Task type; defaults to the checkpoint name.
    #[serde(default)]
    pub task_type: Option<String>,
}

/// `when = { field, equals }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionDef {
    /// Output field tested.
    pub field: String,
    /// Expected value.
    pub equals: serde_json::Value,
}

/// `[[edges]]` entry: exactly one of `to` or `fan_out`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeDef {
    /// Source node.
    pub from: String,
    /// Single successor.
    #[serde(default)]
    pub to: Option<String>,
    /// Fan-out successors.
    #[serde(default)]
    pub fan_out: Option<Vec<String>>,
    /// Condition for a conditional edge; requires `to`.
    #[serde(default)]
    pub when: Option<ConditionDef>,
    /// Exclusive conditional edge.
    #[serde(default)]
    pub exclusive: bool,
}

impl GraphDefinition {
    /// Parses a definition from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, DefinitionError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads and parses a definition file.
    pub fn from_path(path: &Path) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolves handlers and builds the graph.
    pub fn into_graph(self, registry: &HandlerRegistry) -> Result<PipelineGraph, DefinitionError> {
        let mut builder = GraphBuilder::new(self.name);

        for node in self.nodes {
            builder = builder.node(node_spec(node, registry)?);
        }
        for checkpoint in self.checkpoints {
            let task_type = checkpoint.task_type.unwrap_or_else(|| checkpoint.name.clone());
            builder = builder.checkpoint(checkpoint.name, task_type);
        }
        for trigger in self.triggers {
            builder = match trigger.status {
                Some(status) => builder.on_status(trigger.event, status, trigger.entry),
                None => builder.on_event(trigger.event, trigger.entry),
            };
        }
        for edge in self.edges {
            let from = edge.from.clone();
            builder = builder.then(from, successors(edge)?);
        }

        Ok(builder.build()?)
    }
}

/// Loads a graph definition file and builds the graph.
pub fn load_graph(path: &Path, registry: &HandlerRegistry) -> Result<PipelineGraph, DefinitionError> {
    GraphDefinition::from_path(path)?.into_graph(registry)
}

fn node_spec(def: NodeDef, registry: &HandlerRegistry) -> Result<NodeSpec, DefinitionError> {
    let handler = registry
        .resolve(&def.handler, &def.params)
        .map_err(|source| DefinitionError::Handler {
            node: def.name.clone(),
            source,
        })?;

    let mut spec = NodeSpec::new(def.name.clone(), handler);
    if let Some(fields) = def.input {
        spec = spec.with_input(schema(&def.name, "input", fields)?);
    }
    if let Some(fields) = def.output {
        let mut output = schema(&def.name, "output", fields)?;
        if def.strict_output {
            output = output.strict();
        }
        spec = spec.with_output(output);
    }
    if let Some(ms) = def.timeout_ms {
        spec = spec.with_timeout(Duration::from_millis(ms));
    }
    for capability in def.requires {
        spec = spec.requires(capability);
    }
    if let Some(concurrency) = def.concurrency {
        spec = spec.with_concurrency(concurrency);
    }
    Ok(spec)
}

fn schema(node: &str, side: &str, fields: BTreeMap<String, String>) -> Result<Schema, DefinitionError> {
    let mut schema = Schema::new(format!("{node}.{side}"));
    for (field, kind) in fields {
        let spec: FieldSpec = kind.parse().map_err(|reason| DefinitionError::InvalidSchema {
            node: node.to_string(),
            field: field.clone(),
            reason,
        })?;
        schema = schema.field(field, spec);
    }
    Ok(schema)
}

fn successors(edge: EdgeDef) -> Result<Successors, DefinitionError> {
    let invalid = |reason: &str| DefinitionError::InvalidEdge {
        from: edge.from.clone(),
        reason: reason.to_string(),
    };

    match (edge.to.clone(), edge.fan_out.clone(), edge.when.clone()) {
        (Some(_), Some(_), _) => Err(invalid("declare either `to` or `fan_out`, not both")),
        (None, None, _) => Err(invalid("missing `to` or `fan_out`")),
        (None, Some(_), Some(_)) => Err(invalid("`when` applies to a single `to` target")),
        (None, Some(targets), None) => Ok(Successors::from(targets)),
        (Some(target), None, None) => {
            if edge.exclusive {
                Err(invalid("`exclusive` requires `when`"))
            } else {
                Ok(Successors::from(target))
            }
        }
        (Some(target), None, Some(when)) => {
            let mut branch = Branch::when(Condition::field_equals(when.field, when.equals), target);
            if edge.exclusive {
                branch = branch.exclusive();
            }
            Ok(Successors::from(branch))
        }
    }
}
