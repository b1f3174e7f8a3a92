//! The immutable, validated pipeline graph.

use super::spec::{BranchMode, CheckpointSpec, Edge, Node, NodeSpec, Trigger, TriggerBinding};
use crate::core::{LifecycleEvent, Payload};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A validated pipeline graph.
///
/// Produced by [`GraphBuilder::build`](super::GraphBuilder::build) and shared
/// read-only (behind an `Arc`) by every worker task. It has no mutators.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    edges: HashMap<String, Vec<Edge>>,
    triggers: Vec<TriggerBinding>,
}

impl PipelineGraph {
    pub(crate) fn new(
        name: String,
        nodes: HashMap<String, Node>,
        order: Vec<String>,
        edges: HashMap<String, Vec<Edge>>,
        triggers: Vec<TriggerBinding>,
    ) -> Self {
        Self {
            name,
            nodes,
            order,
            edges,
            triggers,
        }
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Returns true if `name` is a checkpoint.
    #[must_use]
    pub fn is_checkpoint(&self, name: &str) -> bool {
        self.nodes.get(name).is_some_and(Node::is_checkpoint)
    }

    /// Returns the nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    /// Returns the executable nodes in declaration order.
    pub fn executable_nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes().filter_map(Node::as_executable)
    }

    /// Returns the checkpoints in declaration order.
    pub fn checkpoints(&self) -> impl Iterator<Item = &CheckpointSpec> {
        self.nodes().filter_map(|node| match node {
            Node::Checkpoint(cp) => Some(cp),
            Node::Executable(_) => None,
        })
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes. Never true for a built graph.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the outgoing edges of a node, in declaration order.
    #[must_use]
    pub fn edges(&self, from: &str) -> &[Edge] {
        self.edges.get(from).map_or(&[][..], Vec::as_slice)
    }

    /// Returns true if the node has at least one outgoing edge.
    #[must_use]
    pub fn has_successors(&self, from: &str) -> bool {
        !self.edges(from).is_empty()
    }

    /// Returns all trigger bindings.
    #[must_use]
    pub fn triggers(&self) -> &[TriggerBinding] {
        &self.triggers
    }

    /// Resolves the successors that fire for a node's validated output.
    ///
    /// Unconditional edges always fire. Conditional edges are evaluated in
    /// declaration order; every matching edge fires until an exclusive one
    /// matches, after which the remaining conditional edges are skipped.
    /// Each successor appears at most once.
    #[must_use]
    pub fn resolve_successors(&self, from: &str, output: &Payload) -> Vec<String> {
        let mut resolved: Vec<String> = Vec::new();
        let mut exclusive_taken = false;

        for edge in self.edges(from) {
            let fired: Vec<&str> = match edge {
                Edge::Direct(_) | Edge::FanOut(_) => edge.targets(),
                Edge::Conditional {
                    condition,
                    target,
                    mode,
                } => {
                    if exclusive_taken || !condition.matches(output) {
                        Vec::new()
                    } else {
                        if *mode == BranchMode::Exclusive {
                            exclusive_taken = true;
                        }
                        vec![target.as_str()]
                    }
                }
            };

            for target in fired {
                if !resolved.iter().any(|r| r == target) {
                    resolved.push(target.to_string());
                }
            }
        }

        resolved
    }

    /// Returns the entry nodes of the event triggers matching `event`.
    #[must_use]
    pub fn entries_for(&self, event: &LifecycleEvent) -> Vec<&str> {
        self.triggers
            .iter()
            .filter(|binding| binding.trigger.matches(event))
            .map(|binding| binding.entry.as_str())
            .collect()
    }

    /// Returns the checkpoints resumed by a finished task of `task_type`.
    #[must_use]
    pub fn checkpoints_for_task(&self, task_type: &str) -> Vec<&str> {
        self.triggers
            .iter()
            .filter_map(|binding| match &binding.trigger {
                Trigger::Finished(checkpoint) => Some(checkpoint.as_str()),
                Trigger::Event { .. } => None,
            })
            .filter(|checkpoint| match self.nodes.get(*checkpoint) {
                Some(Node::Checkpoint(cp)) => cp.task_type == task_type,
                _ => false,
            })
            .collect()
    }

    /// Returns the nodes reachable from any trigger.
    #[must_use]
    pub fn reachable(&self) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.triggers.iter().map(|b| b.entry.as_str()).collect();

        while let Some(name) = stack.pop() {
            if !seen.insert(name.to_string()) {
                continue;
            }
            for edge in self.edges(name) {
                stack.extend(edge.targets());
            }
        }

        seen
    }
}

impl fmt::Display for PipelineGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph '{}': {} nodes", self.name, self.nodes.len())?;
        for binding in &self.triggers {
            if matches!(binding.trigger, Trigger::Event { .. }) {
                writeln!(f, "  on {} -> {}", binding.trigger, binding.entry)?;
            }
        }
        for node in self.nodes() {
            match node {
                Node::Executable(spec) => {
                    write!(f, "  node {}", spec.name)?;
                    if !spec.requires.is_empty() {
                        let caps: Vec<&str> = spec.requires.iter().map(String::as_str).collect();
                        write!(f, " [requires {}]", caps.join(", "))?;
                    }
                }
                Node::Checkpoint(cp) => write!(f, "  checkpoint {} (task {})", cp.name, cp.task_type)?,
            }
            writeln!(f)?;
            for edge in self.edges(node.name()) {
                match edge {
                    Edge::Direct(target) => writeln!(f, "    -> {target}")?,
                    Edge::FanOut(targets) => writeln!(f, "    -> [{}]", targets.join(", "))?,
                    Edge::Conditional {
                        condition,
                        target,
                        mode,
                    } => {
                        let marker = if *mode == BranchMode::Exclusive { " (exclusive)" } else { "" };
                        writeln!(f, "    -> {target} when {condition}{marker}")?;
                    }
                }
            }
        }
        Ok(())
    }
}
