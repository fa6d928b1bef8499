use serde_json::Value;
use std::time::Duration;

use super::model::{ActionEdge, ActionGraph, ActionNode, EdgeGuard};
use super::validate::validate;
use crate::core::errors::{AuraError, Result};

/// Fluent builder for action graphs.
///
/// `then` appends a node that runs after the previously added one, recording
/// both the dependency and the on-success edge so the two always agree.
#[derive(Debug, Clone)]
pub struct ActionGraphBuilder {
    graph: ActionGraph,
    last: Option<String>,
}

impl ActionGraphBuilder {
    pub fn new(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            graph: ActionGraph::new(id, goal),
            last: None,
        }
    }

    /// Graph id generated from a fresh cuid
    pub fn generated(goal: impl Into<String>) -> Self {
        Self::new(format!("graph_{}", cuid2::create_id()), goal)
    }

    pub fn budget(mut self, budget: u64) -> Self {
        self.graph.budget = budget;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.graph.deadline = deadline;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.graph.metadata.insert(key.into(), value);
        self
    }

    /// Add a node without wiring it to anything
    pub fn node(mut self, node: ActionNode) -> Self {
        self.last = Some(node.id.clone());
        self.graph.nodes.push(node);
        self
    }

    /// Add a node that depends on the previously added node
    pub fn then(self, node: ActionNode) -> Self {
        match self.last.clone() {
            Some(prev) => {
                let node = if node.depends_on.contains(&prev) {
                    node
                } else {
                    node.depends_on(prev.clone())
                };
                let id = node.id.clone();
                self.node(node).edge(prev, id)
            }
            None => self.node(node),
        }
    }

    pub fn chain(self, nodes: impl IntoIterator<Item = ActionNode>) -> Self {
        nodes.into_iter().fold(self, |builder, node| builder.then(node))
    }

    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge_when(from, to, EdgeGuard::OnSuccess)
    }

    pub fn edge_when(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        guard: EdgeGuard,
    ) -> Self {
        self.graph.edges.push(ActionEdge::new(from, to, guard));
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<ActionGraph> {
        let violations = validate(&self.graph);
        if violations.is_empty() {
            Ok(self.graph)
        } else {
            Err(AuraError::malformed_graph(self.graph.id, violations))
        }
    }

    /// Build without validation
    pub fn build_unchecked(self) -> ActionGraph {
        self.graph
    }
}
