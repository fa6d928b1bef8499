//! Structural validation and topological layering
//!
//! Both operations work over the same index: one petgraph node per declared
//! node (so `NodeIndex::new(i)` is declaration position `i`), with edges taken
//! from the edge set and, separately, from edges ∪ declared dependencies.

use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::model::{ActionGraph, OperationKind};
use crate::core::errors::{AuraError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum GraphViolation {
    DuplicateNodeId { node_id: String },
    DanglingEdge { from: String, to: String, missing: String },
    UnknownDependency { node_id: String, dependency: String },
    /// A declared dependency that no edge path connects to the node
    DependencyWithoutEdge { node_id: String, dependency: String },
    Cycle { nodes: Vec<String> },
    MissingTarget { node_id: String, kind: OperationKind },
    MissingParameter { node_id: String, parameter: String },
}

impl fmt::Display for GraphViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNodeId { node_id } => write!(f, "duplicate node id '{}'", node_id),
            Self::DanglingEdge { from, to, missing } => {
                write!(f, "edge {} -> {} references unknown node '{}'", from, to, missing)
            }
            Self::UnknownDependency { node_id, dependency } => {
                write!(f, "node '{}' depends on unknown node '{}'", node_id, dependency)
            }
            Self::DependencyWithoutEdge { node_id, dependency } => write!(
                f,
                "node '{}' depends on '{}' but no edge path connects them",
                node_id, dependency
            ),
            Self::Cycle { nodes } => write!(f, "cycle through [{}]", nodes.join(", ")),
            Self::MissingTarget { node_id, kind } => {
                write!(f, "{} node '{}' has no target descriptor", kind, node_id)
            }
            Self::MissingParameter { node_id, parameter } => {
                write!(f, "node '{}' is missing parameter '{}'", node_id, parameter)
            }
        }
    }
}

struct GraphIndex<'a> {
    graph: &'a ActionGraph,
    positions: HashMap<&'a str, usize>,
    duplicates: Vec<&'a str>,
    /// Edges only
    flow: DiGraph<usize, ()>,
    /// Edges plus declared dependencies
    ordering: DiGraph<usize, ()>,
}

impl<'a> GraphIndex<'a> {
    fn build(graph: &'a ActionGraph) -> Self {
        let mut positions = HashMap::new();
        let mut duplicates = Vec::new();
        let mut flow = DiGraph::with_capacity(graph.nodes.len(), graph.edges.len());
        let mut ordering = DiGraph::new();

        for (i, node) in graph.nodes.iter().enumerate() {
            flow.add_node(i);
            ordering.add_node(i);
            if positions.contains_key(node.id.as_str()) {
                duplicates.push(node.id.as_str());
            } else {
                positions.insert(node.id.as_str(), i);
            }
        }

        let mut index = Self {
            graph,
            positions,
            duplicates,
            flow,
            ordering,
        };

        for edge in &graph.edges {
            if let (Some(from), Some(to)) = (index.lookup(&edge.from), index.lookup(&edge.to)) {
                index.flow.add_edge(from, to, ());
                index.ordering.add_edge(from, to, ());
            }
        }
        for node in &graph.nodes {
            let Some(to) = index.lookup(&node.id) else { continue };
            for dep in &node.depends_on {
                if let Some(from) = index.lookup(dep) {
                    index.ordering.add_edge(from, to, ());
                }
            }
        }
        index
    }

    fn lookup(&self, id: &str) -> Option<NodeIndex> {
        self.positions.get(id).map(|&i| NodeIndex::new(i))
    }

    fn id_of(&self, idx: NodeIndex) -> &'a str {
        self.graph.nodes[idx.index()].id.as_str()
    }

    /// Cyclic strongly connected components, each in declaration order,
    /// ordered by their first member.
    fn cycles(&self) -> Vec<Vec<String>> {
        let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(&self.ordering)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.ordering.contains_edge(scc[0], scc[0])
            })
            .collect();
        for scc in &mut components {
            scc.sort_by_key(|idx| idx.index());
        }
        components.sort_by_key(|scc| scc[0].index());
        components
            .into_iter()
            .map(|scc| scc.into_iter().map(|idx| self.id_of(idx).to_string()).collect())
            .collect()
    }

    /// Kahn's algorithm by levels. `None` when some nodes sit on or behind a cycle.
    fn layers(&self) -> Option<Vec<Vec<String>>> {
        let mut in_degree: Vec<usize> = self
            .ordering
            .node_indices()
            .map(|idx| self.ordering.edges_directed(idx, Direction::Incoming).count())
            .collect();

        let mut current: Vec<NodeIndex> = self
            .ordering
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .collect();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            current.sort_by_key(|idx| idx.index());
            let mut next = Vec::new();
            for &idx in &current {
                for succ in self.ordering.neighbors_directed(idx, Direction::Outgoing) {
                    let degree = &mut in_degree[succ.index()];
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(succ);
                    }
                }
            }
            placed += current.len();
            layers.push(current.iter().map(|&idx| self.id_of(idx).to_string()).collect());
            current = next;
        }

        (placed == self.ordering.node_count()).then_some(layers)
    }
}

/// Check a graph for structural problems.
///
/// Returns every violation found, in a stable order: duplicates, edges,
/// dependencies, cycles, then per-node field requirements. An empty list
/// means the graph is well-formed.
pub fn validate(graph: &ActionGraph) -> Vec<GraphViolation> {
    let index = GraphIndex::build(graph);
    let mut violations = Vec::new();

    for id in &index.duplicates {
        violations.push(GraphViolation::DuplicateNodeId {
            node_id: id.to_string(),
        });
    }

    for edge in &graph.edges {
        for end in [&edge.from, &edge.to] {
            if index.lookup(end).is_none() {
                violations.push(GraphViolation::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: end.clone(),
                });
            }
        }
    }

    for (i, node) in graph.nodes.iter().enumerate() {
        let this = NodeIndex::new(i);
        for dep in &node.depends_on {
            match index.lookup(dep) {
                None => violations.push(GraphViolation::UnknownDependency {
                    node_id: node.id.clone(),
                    dependency: dep.clone(),
                }),
                Some(dep_idx) => {
                    if dep_idx == this || !has_path_connecting(&index.flow, dep_idx, this, None) {
                        violations.push(GraphViolation::DependencyWithoutEdge {
                            node_id: node.id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }
    }

    for nodes in index.cycles() {
        violations.push(GraphViolation::Cycle { nodes });
    }

    for node in &graph.nodes {
        if node.kind.requires_target() && node.target.is_none() {
            violations.push(GraphViolation::MissingTarget {
                node_id: node.id.clone(),
                kind: node.kind,
            });
        }
        for param in node.kind.required_params() {
            let present = node.params.get(*param).map_or(false, |v| !v.is_null());
            if !present {
                violations.push(GraphViolation::MissingParameter {
                    node_id: node.id.clone(),
                    parameter: param.to_string(),
                });
            }
        }
    }

    violations
}

/// Partition nodes into levels whose dependencies all lie in earlier levels.
///
/// Nodes within a level are listed in declaration order. Fails with
/// `MalformedGraph` on duplicate ids or cycles.
pub fn topological_layers(graph: &ActionGraph) -> Result<Vec<Vec<String>>> {
    let index = GraphIndex::build(graph);
    if !index.duplicates.is_empty() {
        return Err(AuraError::malformed_graph(&graph.id, validate(graph)));
    }
    index
        .layers()
        .ok_or_else(|| AuraError::malformed_graph(&graph.id, validate(graph)))
}
