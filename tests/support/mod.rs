//! Shared fixtures for the integration suites

#![allow(dead_code)]

use aura::core::OrchestratorConfig;
use aura::graph::{ActionGraph, ActionGraphBuilder, ActionNode};
use aura::scheduler::{BufferingEventSink, RuntimeEvent};
use aura::supervisor::TaskSupervisorBuilder;
use aura::testing::{ScriptedPlanner, ScriptedSurface, StaticResolver};
use aura::TaskSupervisor;
use std::sync::Arc;
use std::time::Duration;

pub const SEARCH_GOAL: &str = "search for Kindle on example.com";

/// navigate -> locate -> type -> click -> assert, one node per layer
pub fn search_graph(id: &str, results: &str) -> ActionGraph {
    ActionGraphBuilder::new(id, SEARCH_GOAL)
        .chain(vec![
            ActionNode::navigate("navigate", "https://example.com"),
            ActionNode::wait_for("locate", "#search-box"),
            ActionNode::type_text("type", "#search-box", "Kindle"),
            ActionNode::click("click", "#search-button"),
            ActionNode::assert_present("assert", results),
        ])
        .build()
        .expect("search graph is well formed")
}

/// `width` independent extract nodes
pub fn wide_graph(id: &str, width: usize) -> ActionGraph {
    let mut builder = ActionGraphBuilder::new(id, "read everything");
    for i in 0..width {
        builder = builder.node(ActionNode::extract(format!("read-{}", i), format!("#item-{}", i)));
    }
    builder.build().expect("wide graph is well formed")
}

pub fn base_builder(
    planner: ScriptedPlanner,
    resolver: StaticResolver,
    surface: Arc<ScriptedSurface>,
) -> TaskSupervisorBuilder {
    TaskSupervisor::builder()
        .config(OrchestratorConfig::development())
        .planner(Arc::new(planner))
        .resolver(Arc::new(resolver))
        .surface(surface)
}

/// Poll `events` until a node with `node_id` has started
pub async fn wait_for_start(events: &BufferingEventSink, node_id: &str) {
    let started = |e: &RuntimeEvent| matches!(e, RuntimeEvent::NodeStarted { node_id: id, .. } if id == node_id);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !events.get_events().iter().any(|e| started(&e.event)) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("node never started");
}
