//! Graph builder with validation.

use super::graph::PipelineGraph;
use super::spec::{CheckpointSpec, Edge, Node, NodeSpec, Successors, Trigger, TriggerBinding};
use crate::errors::BuildError;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Builder for pipeline graphs.
///
/// Declarations are collected as-is and checked together in
/// [`GraphBuilder::build`], so nodes and edges may be declared in any order.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    /// The graph name.
    name: String,
    /// Declared nodes, in declaration order.
    nodes: Vec<Node>,
    /// Declared edges, in declaration order.
    edges: Vec<(String, Edge)>,
    /// Declared event triggers.
    triggers: Vec<TriggerBinding>,
}

impl GraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            triggers: Vec::new(),
        }
    }

    /// Declares an executable node.
    #[must_use]
    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(Node::Executable(spec));
        self
    }

    /// Declares a human checkpoint.
    ///
    /// Its completion trigger `finished(name)` is registered automatically;
    /// edges declared from the checkpoint are the successors it resumes into.
    #[must_use]
    pub fn checkpoint(mut self, name: impl Into<String>, task_type: impl Into<String>) -> Self {
        self.nodes.push(Node::Checkpoint(CheckpointSpec {
            name: name.into(),
            task_type: task_type.into(),
        }));
        self
    }

    /// Starts traversal at `entry` when the named event arrives.
    #[must_use]
    pub fn on_event(mut self, event: impl Into<String>, entry: impl Into<String>) -> Self {
        self.triggers.push(TriggerBinding {
            trigger: Trigger::event(event),
            entry: entry.into(),
        });
        self
    }

    /// Starts traversal at `entry` when the named event arrives with `status`.
    #[must_use]
    pub fn on_status(
        mut self,
        event: impl Into<String>,
        status: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        self.triggers.push(TriggerBinding {
            trigger: Trigger::Event {
                name: event.into(),
                status: Some(status.into()),
            },
            entry: entry.into(),
        });
        self
    }

    /// Declares successors of `from`: a node name, a fan-out set or a
    /// conditional [`Branch`](super::Branch).
    #[must_use]
    pub fn then(mut self, from: impl Into<String>, successors: impl Into<Successors>) -> Self {
        self.edges.push((from.into(), successors.into().0));
        self
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of declared nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Validates the declarations and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: an empty graph, a duplicate name, a
    /// reference to an undeclared node, a malformed fan-out, a condition on
    /// a field the node's output contract does not declare, or a cycle.
    pub fn build(self) -> Result<PipelineGraph, BuildError> {
        if self.nodes.is_empty() {
            return Err(BuildError::empty(&self.name));
        }

        let mut nodes: HashMap<String, Node> = HashMap::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            let name = node.name().to_string();
            if nodes.contains_key(&name) {
                return Err(BuildError::duplicate_node(&name));
            }
            order.push(name.clone());
            nodes.insert(name, node);
        }

        for binding in &self.triggers {
            if !nodes.contains_key(&binding.entry) {
                return Err(BuildError::missing_node(
                    &format!("Trigger '{}'", binding.trigger),
                    &binding.entry,
                ));
            }
        }

        let mut edges: HashMap<String, Vec<Edge>> = HashMap::new();
        for (from, edge) in self.edges {
            let Some(source) = nodes.get(&from) else {
                return Err(BuildError::missing_node("Edge declaration", &from));
            };
            validate_edge(source, &from, &edge, &nodes)?;
            edges.entry(from).or_default().push(edge);
        }

        let mut triggers = self.triggers;
        for name in &order {
            if nodes.get(name).is_some_and(Node::is_checkpoint) {
                triggers.push(TriggerBinding {
                    trigger: Trigger::Finished(name.clone()),
                    entry: name.clone(),
                });
            }
        }

        if let Some(cycle) = detect_cycle(&order, &edges) {
            return Err(BuildError::cycle(cycle));
        }

        let graph = PipelineGraph::new(self.name, nodes, order, edges, triggers);
        warn_unreachable(&graph);
        Ok(graph)
    }
}

fn validate_edge(
    source: &Node,
    from: &str,
    edge: &Edge,
    nodes: &HashMap<String, Node>,
) -> Result<(), BuildError> {
    if let Edge::FanOut(targets) = edge {
        if targets.len() < 2 {
            return Err(BuildError::invalid_fan_out(
                from,
                targets,
                "a fan-out needs at least two targets",
            ));
        }
        let unique: HashSet<&String> = targets.iter().collect();
        if unique.len() != targets.len() {
            return Err(BuildError::invalid_fan_out(
                from,
                targets,
                "a fan-out lists the same target twice",
            ));
        }
    }

    for target in edge.targets() {
        if !nodes.contains_key(target) {
            return Err(BuildError::missing_node(&format!("Edge from '{from}'"), target));
        }
    }

    if let Edge::Conditional { condition, .. } = edge {
        let declared = source
            .as_executable()
            .and_then(|spec| spec.output_contract.as_ref())
            .and_then(|contract| contract.field_names());
        if let Some(fields) = declared {
            if !fields.iter().any(|f| f == condition.field()) {
                return Err(BuildError::unknown_condition_field(from, condition.field()));
            }
        }
    }

    Ok(())
}

/// Detects cycles with a depth-first search over successors.
///
/// Nodes are visited in declaration order so the reported path is stable.
fn detect_cycle(order: &[String], edges: &HashMap<String, Vec<Edge>>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for name in order {
        if !visited.contains(name.as_str()) {
            if let Some(cycle) = dfs_cycle(name, edges, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}

fn dfs_cycle<'a>(
    node: &'a str,
    edges: &'a HashMap<String, Vec<Edge>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for edge in edges.get(node).into_iter().flatten() {
        for next in edge.targets() {
            if !visited.contains(next) {
                if let Some(cycle) = dfs_cycle(next, edges, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(next) {
                if let Some(start) = path.iter().position(|n| *n == next) {
                    let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

fn warn_unreachable(graph: &PipelineGraph) {
    let reachable = graph.reachable();
    for node in graph.nodes() {
        if !reachable.contains(node.name()) {
            warn!(
                graph = graph.name(),
                node = node.name(),
                "Node is not reachable from any trigger"
            );
        }
    }
}
