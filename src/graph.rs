// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The workflow graph: typed nodes and edges, immutable once validated.
//!
//! A [`Graph`] is two flat collections — an id→node map plus an ordered edge
//! list — with a derived adjacency index. Construction rejects duplicate
//! node ids and dangling edge endpoints immediately; [`Graph::validate`]
//! then reports structural defects (missing entry/exit points, unreachable
//! nodes, conditional edges without predicates) as a list of
//! [`Violation`]s so a run never starts on a defective graph.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::edge::{Edge, EdgeKind};
use crate::error::{Error, Result, Violation};
use crate::node::{Node, NodeKind};

/// A validated-once, then immutable workflow graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Human-readable workflow name, used in spans and manifests.
    pub name: String,
    nodes: HashMap<String, Node>,
    /// Node ids in insertion order; entry-point seeding and manifests keep
    /// this order for determinism.
    node_order: Vec<String>,
    edges: Vec<Edge>,
    /// Source id → indices into `edges`, in insertion order.
    adjacency: HashMap<String, Vec<usize>>,
    /// Target id → source ids.
    reverse: HashMap<String, Vec<String>>,
}

impl Graph {
    /// Empty graph with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a node.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateNode`] if a node with the same id exists.
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(Error::DuplicateNode(node.id));
        }
        tracing::debug!(node = %node.id, kind = ?node.kind(), "node added");
        self.node_order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Add an edge.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownNode`] if either endpoint is not in the graph.
    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        if !self.nodes.contains_key(&edge.source) {
            return Err(Error::UnknownNode(edge.source));
        }
        if !self.nodes.contains_key(&edge.target) {
            return Err(Error::UnknownNode(edge.target));
        }
        tracing::debug!(source = %edge.source, target = %edge.target, kind = ?edge.kind, "edge added");
        let index = self.edges.len();
        self.adjacency
            .entry(edge.source.clone())
            .or_default()
            .push(index);
        self.reverse
            .entry(edge.target.clone())
            .or_default()
            .push(edge.source.clone());
        self.edges.push(edge);
        Ok(())
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.node_order.iter().map(String::as_str)
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Outgoing edges of a node, in insertion order.
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.adjacency
            .get(id)
            .into_iter()
            .flatten()
            .map(|&index| &self.edges[index])
    }

    /// Source ids of edges pointing at `id`.
    pub fn incoming(&self, id: &str) -> &[String] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entry points: nodes with no incoming edges, or explicit Input nodes.
    /// Insertion order, deduplicated.
    pub fn entry_points(&self) -> Vec<&str> {
        let mut entries: Vec<&str> = self
            .node_order
            .iter()
            .filter(|id| !self.reverse.contains_key(id.as_str()))
            .map(String::as_str)
            .collect();
        if entries.is_empty() {
            entries = self
                .node_order
                .iter()
                .filter(|id| self.nodes[id.as_str()].kind() == NodeKind::Input)
                .map(String::as_str)
                .collect();
        }
        entries
    }

    /// Exit points: nodes with no outgoing edges, or explicit Output nodes.
    pub fn exit_points(&self) -> Vec<&str> {
        self.node_order
            .iter()
            .filter(|id| {
                !self.adjacency.contains_key(id.as_str())
                    || self.nodes[id.as_str()].kind() == NodeKind::Output
            })
            .map(String::as_str)
            .collect()
    }

    /// Whether `id` is an exit point.
    pub fn is_exit_point(&self, id: &str) -> bool {
        !self.adjacency.contains_key(id)
            || self
                .nodes
                .get(id)
                .is_some_and(|node| node.kind() == NodeKind::Output)
    }

    /// Validate the graph structure.
    ///
    /// Pure and side-effect-free; callable repeatedly. An empty list means
    /// the graph is valid. Covered defects: no entry point, no exit point,
    /// exit unreachable from an entry, unreachable nodes, conditional edges
    /// without a predicate, dangling edge endpoints (unreachable through
    /// [`Graph::add_edge`], but checked for graphs assembled by hand).
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source) || !self.nodes.contains_key(&edge.target) {
                violations.push(Violation::DanglingEdge {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                });
            }
            if edge.kind == EdgeKind::Conditional && edge.condition.is_none() {
                violations.push(Violation::ConditionalEdgeWithoutCondition {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                });
            }
        }

        let entries = self.entry_points();
        let exits: HashSet<&str> = self.exit_points().into_iter().collect();
        if entries.is_empty() {
            violations.push(Violation::NoEntryPoint);
        }
        if exits.is_empty() {
            violations.push(Violation::NoExitPoint);
        }

        let mut reachable_from_any: HashSet<&str> = HashSet::new();
        for entry in &entries {
            let reachable = self.reachable_from(entry);
            if !exits.is_empty() && !reachable.iter().any(|id| exits.contains(id)) {
                violations.push(Violation::ExitUnreachable {
                    entry: (*entry).to_string(),
                });
            }
            reachable_from_any.extend(reachable);
        }
        if !entries.is_empty() {
            for id in &self.node_order {
                if !reachable_from_any.contains(id.as_str()) {
                    violations.push(Violation::UnreachableNode { node: id.clone() });
                }
            }
        }

        violations
    }

    /// Validate and convert violations into an error, used by the scheduler
    /// before any run starts.
    pub fn validated(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::EmptyGraph);
        }
        let violations = self.validate();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(violations))
        }
    }

    fn reachable_from<'a>(&'a self, start: &'a str) -> HashSet<&'a str> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            for edge in self.outgoing(id) {
                if !visited.contains(edge.target.as_str()) {
                    stack.push(edge.target.as_str());
                }
            }
        }
        visited
    }

    /// Serializable summary of the graph for introspection surfaces.
    pub fn manifest(&self) -> GraphManifest {
        GraphManifest {
            name: self.name.clone(),
            nodes: self
                .node_order
                .iter()
                .map(|id| {
                    let node = &self.nodes[id.as_str()];
                    NodeManifest {
                        id: id.clone(),
                        kind: node.kind(),
                        config: serde_json::to_value(&node.config).unwrap_or(Value::Null),
                    }
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|edge| EdgeManifest {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    kind: edge.kind,
                    priority: edge.priority,
                })
                .collect(),
        }
    }

    /// Mermaid flowchart rendering of the graph.
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["graph TD".to_string()];
        for id in &self.node_order {
            let node = &self.nodes[id.as_str()];
            let label = format!("{id}\\n[{kind:?}]", kind = node.kind());
            let shape = match node.kind() {
                NodeKind::Input | NodeKind::Output => format!("    {id}([\"{label}\"])"),
                NodeKind::Condition => format!("    {id}{{{{\"{label}\"}}}}"),
                _ => format!("    {id}[\"{label}\"]"),
            };
            lines.push(shape);
        }
        lines.push(String::new());
        for edge in &self.edges {
            let line = match edge.kind {
                EdgeKind::Plain => format!("    {} --> {}", edge.source, edge.target),
                EdgeKind::Conditional => {
                    format!("    {} -->|conditional| {}", edge.source, edge.target)
                }
                EdgeKind::Parallel => {
                    format!("    {} -.parallel.-> {}", edge.source, edge.target)
                }
            };
            lines.push(line);
        }
        lines.join("\n")
    }

    /// GraphViz DOT rendering of the graph.
    pub fn to_dot(&self) -> String {
        let mut lines = vec![
            format!("digraph \"{}\" {{", self.name),
            "    rankdir=TB;".to_string(),
        ];
        for id in &self.node_order {
            let node = &self.nodes[id.as_str()];
            let shape = match node.kind() {
                NodeKind::Input | NodeKind::Output => "ellipse",
                NodeKind::Condition => "diamond",
                NodeKind::Subgraph => "box3d",
                _ => "box",
            };
            lines.push(format!(
                "    {id} [label=\"{id}\\n[{kind:?}]\", shape={shape}];",
                kind = node.kind()
            ));
        }
        for edge in &self.edges {
            let attrs = match edge.kind {
                EdgeKind::Conditional => " [style=dashed, label=\"conditional\"]",
                EdgeKind::Parallel => " [color=blue, label=\"parallel\"]",
                EdgeKind::Plain => "",
            };
            lines.push(format!("    {} -> {}{attrs};", edge.source, edge.target));
        }
        lines.push("}".to_string());
        lines.join("\n")
    }
}

/// Serializable graph summary.
#[derive(Debug, Clone, Serialize)]
pub struct GraphManifest {
    /// Workflow name.
    pub name: String,
    /// Nodes in insertion order.
    pub nodes: Vec<NodeManifest>,
    /// Edges in insertion order.
    pub edges: Vec<EdgeManifest>,
}

/// Node entry in a [`GraphManifest`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeManifest {
    /// Node id.
    pub id: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Serialized typed config.
    pub config: Value,
}

/// Edge entry in a [`GraphManifest`].
#[derive(Debug, Clone, Serialize)]
pub struct EdgeManifest {
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Edge kind.
    pub kind: EdgeKind,
    /// Edge priority.
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_graph() -> Graph {
        let mut graph = Graph::new("linear");
        graph.add_node(Node::input("start")).unwrap();
        graph.add_node(Node::agent("work", "worker")).unwrap();
        graph.add_node(Node::output("end")).unwrap();
        graph.add_edge(Edge::plain("start", "work")).unwrap();
        graph.add_edge(Edge::plain("work", "end")).unwrap();
        graph
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut graph = Graph::new("g");
        graph.add_node(Node::input("a")).unwrap();
        assert!(matches!(
            graph.add_node(Node::output("a")),
            Err(Error::DuplicateNode(id)) if id == "a"
        ));
    }

    #[test]
    fn dangling_edge_rejected() {
        let mut graph = Graph::new("g");
        graph.add_node(Node::input("a")).unwrap();
        assert!(matches!(
            graph.add_edge(Edge::plain("a", "missing")),
            Err(Error::UnknownNode(id)) if id == "missing"
        ));
        assert!(matches!(
            graph.add_edge(Edge::plain("missing", "a")),
            Err(Error::UnknownNode(id)) if id == "missing"
        ));
    }

    #[test]
    fn valid_graph_has_no_violations() {
        let graph = linear_graph();
        assert!(graph.validate().is_empty());
        assert!(graph.validated().is_ok());
        // Pure: repeated calls agree.
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn entry_and_exit_points_derived() {
        let graph = linear_graph();
        assert_eq!(graph.entry_points(), vec!["start"]);
        assert_eq!(graph.exit_points(), vec!["end"]);
        assert!(graph.is_exit_point("end"));
        assert!(!graph.is_exit_point("work"));
    }

    #[test]
    fn cycle_graph_entry_via_input_marker() {
        // a <-> b cycle: every node has incoming edges, so the explicit
        // Input node is the entry point.
        let mut graph = Graph::new("cycle");
        graph.add_node(Node::input("a")).unwrap();
        graph.add_node(Node::agent("b", "x")).unwrap();
        graph.add_edge(Edge::plain("a", "b")).unwrap();
        graph.add_edge(Edge::plain("b", "a")).unwrap();
        assert_eq!(graph.entry_points(), vec!["a"]);
    }

    #[test]
    fn unreachable_node_reported() {
        // An isolated two-node cycle: both members have incoming edges so
        // neither is an entry point, and no entry point reaches them.
        let mut graph = linear_graph();
        graph.add_node(Node::agent("c1", "x")).unwrap();
        graph.add_node(Node::agent("c2", "x")).unwrap();
        graph.add_edge(Edge::plain("c1", "c2")).unwrap();
        graph.add_edge(Edge::plain("c2", "c1")).unwrap();

        let violations = graph.validate();
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::UnreachableNode { node } if node == "c1")));
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::UnreachableNode { node } if node == "c2")));
    }

    #[test]
    fn conditional_edge_without_predicate_reported() {
        let mut graph = Graph::new("g");
        graph.add_node(Node::input("a")).unwrap();
        graph.add_node(Node::output("b")).unwrap();
        graph
            .add_edge(Edge {
                source: "a".to_string(),
                target: "b".to_string(),
                kind: EdgeKind::Conditional,
                condition: None,
                priority: 0,
                metadata: HashMap::new(),
            })
            .unwrap();
        let violations = graph.validate();
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::ConditionalEdgeWithoutCondition { .. })));
        assert!(graph.validated().is_err());
    }

    #[test]
    fn empty_graph_cannot_run() {
        let graph = Graph::new("empty");
        assert!(matches!(graph.validated(), Err(Error::EmptyGraph)));
    }

    #[test]
    fn manifest_preserves_order() {
        let graph = linear_graph();
        let manifest = graph.manifest();
        assert_eq!(manifest.name, "linear");
        let ids: Vec<&str> = manifest.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["start", "work", "end"]);
        assert_eq!(manifest.edges.len(), 2);
    }

    #[test]
    fn renderings_mention_every_node() {
        let graph = linear_graph();
        let mermaid = graph.to_mermaid();
        let dot = graph.to_dot();
        for id in ["start", "work", "end"] {
            assert!(mermaid.contains(id));
            assert!(dot.contains(id));
        }
        assert!(dot.starts_with("digraph \"linear\""));
    }
}
