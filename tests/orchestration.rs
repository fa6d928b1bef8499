//! End-to-end task orchestration scenarios

mod support;

use async_trait::async_trait;
use aura::core::{OrchestratorConfig, ReasonCode};
use aura::exec::{NodeStatus, SkipReason};
use aura::external::{
    ApprovalOutcome, Constraints, InMemoryProcedureLibrary, PlanningFailed, Planner,
    PolicyDecision, PolicyGate, ProcedureMatch, ProcedureTemplate, RulePolicyGate,
};
use aura::graph::{ActionGraph, ActionGraphBuilder, ActionNode};
use aura::router::{ExecutionMode, RequestedMode};
use aura::scheduler::BufferingEventSink;
use aura::supervisor::{CancelAck, RiskLevel, TaskRequest, TaskStatus, TaskView};
use aura::testing::{FixedApprovals, ScriptedPlanner, ScriptedSurface, StaticMatcher, StaticResolver};
use aura::{topological_layers, TaskSupervisor};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::{base_builder, search_graph, wait_for_start, wide_graph, SEARCH_GOAL};

#[tokio::test]
async fn test_dynamic_search_completes_in_five_layers() {
    let graph = search_graph("plan-1", "#results");
    assert_eq!(topological_layers(&graph).unwrap().len(), 5);

    let surface = Arc::new(ScriptedSurface::new());
    let supervisor = base_builder(
        ScriptedPlanner::returning(graph),
        StaticResolver::new(),
        surface.clone(),
    )
    .matcher(Arc::new(StaticMatcher::new(vec![ProcedureMatch::new(
        "unrelated",
        0.0,
        "example.com",
    )])))
    .build()
    .unwrap();

    let id = supervisor.submit(TaskRequest::new(SEARCH_GOAL)).unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.mode, Some(ExecutionMode::Dynamic));
    assert!(!view.degraded);
    assert_eq!(view.graph_id.as_deref(), Some("plan-1"));
    assert_eq!(view.records.len(), 5);
    assert!(view.records.iter().all(|r| r.status == NodeStatus::Succeeded));
    assert_eq!(view.budget_consumed, 5);
    assert!(view.failure.is_none());
    assert!(view.started_at.is_some() && view.completed_at.is_some());
    assert!(view
        .events
        .iter()
        .any(|e| e.event == "run_started" && e.detail.contains("5 layers")));

    let kinds: Vec<String> = surface.calls().iter().map(|c| c.kind.as_str().to_string()).collect();
    assert_eq!(kinds, vec!["navigate", "wait-for", "type-text", "click", "assert"]);
}

#[tokio::test]
async fn test_structural_mismatch_falls_back_to_dynamic_once() {
    let procedure_graph = search_graph("stored", "#old-results");
    let library = Arc::new(
        InMemoryProcedureLibrary::new()
            .with_procedure(ProcedureTemplate::new("example-search", "example.com", procedure_graph)),
    );
    let planner = ScriptedPlanner::returning(search_graph("fresh", "#results"));
    let supervisor = base_builder(
        planner,
        StaticResolver::new().unresolvable("#old-results"),
        Arc::new(ScriptedSurface::new()),
    )
    .matcher(Arc::new(StaticMatcher::new(vec![ProcedureMatch::new(
        "example-search",
        0.95,
        "example.com",
    )])))
    .library(library.clone())
    .build()
    .unwrap();

    let id = supervisor.submit(TaskRequest::new(SEARCH_GOAL)).unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert!(view.degraded);
    assert_eq!(view.mode, Some(ExecutionMode::Dynamic));
    assert_eq!(view.graph_id.as_deref(), Some("fresh"));
    // five nodes from the failed procedure run plus five from the plan
    assert_eq!(view.budget_consumed, 10);
    assert!(view.events.iter().any(|e| e.event == "degraded"
        && e.detail.contains("STRUCTURAL_MISMATCH")));

    let stats = library.stats("example-search");
    assert_eq!((stats.successes, stats.failures), (0, 1));
}

#[tokio::test]
async fn test_fallback_failure_is_terminal() {
    let procedure_graph = search_graph("stored", "#old-results");
    let library = Arc::new(
        InMemoryProcedureLibrary::new()
            .with_procedure(ProcedureTemplate::new("example-search", "example.com", procedure_graph)),
    );
    // the fresh plan also points at the missing element
    let planner = ScriptedPlanner::returning(search_graph("fresh", "#old-results"));
    let supervisor = base_builder(
        planner,
        StaticResolver::new().unresolvable("#old-results"),
        Arc::new(ScriptedSurface::new()),
    )
    .matcher(Arc::new(StaticMatcher::new(vec![ProcedureMatch::new(
        "example-search",
        0.95,
        "example.com",
    )])))
    .library(library)
    .build()
    .unwrap();

    let id = supervisor.submit(TaskRequest::new(SEARCH_GOAL)).unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    assert!(view.degraded);
    assert_eq!(view.failure.unwrap().code, ReasonCode::StructuralMismatch);
    assert_eq!(view.events.iter().filter(|e| e.event == "degraded").count(), 1);
}

#[tokio::test]
async fn test_missing_procedure_uses_fallback() {
    let planner = ScriptedPlanner::returning(search_graph("fresh", "#results"));
    let supervisor = base_builder(planner, StaticResolver::new(), Arc::new(ScriptedSurface::new()))
        .matcher(Arc::new(StaticMatcher::new(vec![ProcedureMatch::new(
            "ghost",
            0.99,
            "*",
        )])))
        .build()
        .unwrap();

    let id = supervisor.submit(TaskRequest::new(SEARCH_GOAL)).unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert!(view.degraded);
}

#[tokio::test]
async fn test_in_memory_library_drives_deterministic_mode() {
    let template_graph = ActionGraphBuilder::new("order-status", "check order status")
        .chain(vec![
            ActionNode::navigate("open", "https://shop.example.com/orders/{{order}}"),
            ActionNode::extract("status", "#status"),
        ])
        .build()
        .unwrap();
    let library = Arc::new(InMemoryProcedureLibrary::new().with_procedure(
        ProcedureTemplate::new("order-status", "example.com", template_graph)
            .keywords(["order", "status"])
            .requires("order"),
    ));
    let surface = Arc::new(ScriptedSurface::new());
    let supervisor = base_builder(ScriptedPlanner::failing("planner unused"), StaticResolver::new(), surface.clone())
        .procedures(library.clone())
        .build()
        .unwrap();

    let request = TaskRequest::new("check order status on shop.example.com")
        .constraint("order", serde_json::json!("A-17"));
    let id = supervisor.submit(request).unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(
        view.mode,
        Some(ExecutionMode::Deterministic {
            procedure_id: "order-status".to_string()
        })
    );
    let result = view.result.unwrap();
    assert_eq!(
        result["open"]["params"]["url"],
        serde_json::json!("https://shop.example.com/orders/A-17")
    );
    assert_eq!(library.stats("order-status").successes, 1);
}

#[tokio::test]
async fn test_cancel_mid_layer_keeps_partial_records() {
    let graph = ActionGraphBuilder::new("four", "four steps")
        .chain(vec![
            ActionNode::extract("first", "#a"),
            ActionNode::extract("second", "#b"),
            ActionNode::extract("third", "#c"),
            ActionNode::extract("fourth", "#d"),
        ])
        .build()
        .unwrap();
    let surface = Arc::new(ScriptedSurface::new().with_delay(Duration::from_millis(100)));
    let events = Arc::new(BufferingEventSink::new());
    let supervisor = base_builder(ScriptedPlanner::returning(graph), StaticResolver::new(), surface.clone())
        .event_sink(events.clone())
        .build()
        .unwrap();

    let id = supervisor.submit(TaskRequest::new("four steps")).unwrap();
    wait_for_start(&events, "second").await;
    assert_eq!(supervisor.cancel(&id), CancelAck::Accepted);
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Cancelled);
    assert_eq!(view.failure.as_ref().map(|f| f.code), Some(ReasonCode::Cancelled));
    let statuses: Vec<NodeStatus> = view.records.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            NodeStatus::Succeeded,
            NodeStatus::Succeeded,
            NodeStatus::Skipped,
            NodeStatus::Skipped
        ]
    );
    assert_eq!(view.records[2].skip_reason, Some(SkipReason::Cancelled));
    assert_eq!(surface.call_count(), 2);
    assert_eq!(supervisor.cancel(&id), CancelAck::AlreadyTerminal);
}

#[tokio::test]
async fn test_cancel_while_pending() {
    let config = OrchestratorConfig::builder()
        .max_concurrent_tasks(1)
        .build()
        .unwrap();
    let surface = Arc::new(ScriptedSurface::new().with_delay(Duration::from_millis(50)));
    let events = Arc::new(BufferingEventSink::new());
    let supervisor = base_builder(
        ScriptedPlanner::returning(search_graph("plan", "#results")),
        StaticResolver::new(),
        surface,
    )
    .config(config)
    .event_sink(events.clone())
    .build()
    .unwrap();

    let busy = supervisor.submit(TaskRequest::new(SEARCH_GOAL)).unwrap();
    wait_for_start(&events, "navigate").await;
    let queued = supervisor.submit(TaskRequest::new(SEARCH_GOAL)).unwrap();
    assert_eq!(supervisor.get_status(&queued).unwrap().status, TaskStatus::Pending);

    assert_eq!(supervisor.cancel(&queued), CancelAck::Accepted);
    let view = supervisor.wait(&queued).await.unwrap();
    assert_eq!(view.status, TaskStatus::Cancelled);
    assert!(view.started_at.is_some());
    assert!(view.records.is_empty());

    let busy = supervisor.wait(&busy).await.unwrap();
    assert_eq!(busy.status, TaskStatus::Completed);

    let stats = supervisor.stats();
    assert_eq!((stats.completed, stats.cancelled), (1, 1));
    assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_policy_denies_sensitive_input_before_execution() {
    let graph = ActionGraphBuilder::new("login", "log in")
        .chain(vec![
            ActionNode::navigate("open", "https://example.com/login"),
            ActionNode::type_text("secret", "#password", "hunter2"),
        ])
        .build()
        .unwrap();
    let surface = Arc::new(ScriptedSurface::new());
    let supervisor = base_builder(ScriptedPlanner::returning(graph), StaticResolver::new(), surface.clone())
        .policy(Arc::new(RulePolicyGate::default()))
        .build()
        .unwrap();

    let id = supervisor.submit(TaskRequest::new("log in to example.com")).unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    let failure = view.failure.unwrap();
    assert_eq!(failure.code, ReasonCode::PolicyDenied);
    assert!(failure.detail.contains("deny-sensitive-input"));
    assert_eq!(surface.call_count(), 0);
    assert!(view.records.is_empty());
}

#[tokio::test]
async fn test_unresolved_approval_fails_task() {
    let surface = Arc::new(ScriptedSurface::new());
    let supervisor = base_builder(
        ScriptedPlanner::returning(search_graph("plan", "#results")),
        StaticResolver::new(),
        surface.clone(),
    )
    .policy(Arc::new(RulePolicyGate::default()))
    .build()
    .unwrap();

    let id = supervisor
        .submit(TaskRequest::new("buy a Kindle on example.com"))
        .unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.failure.unwrap().code, ReasonCode::ApprovalRequired);
    assert_eq!(surface.call_count(), 0);
}

#[tokio::test]
async fn test_approval_handler_decides() {
    for (outcome, expected, code) in [
        (ApprovalOutcome::Approved, TaskStatus::Completed, None),
        (
            ApprovalOutcome::Rejected,
            TaskStatus::Failed,
            Some(ReasonCode::PolicyDenied),
        ),
        (
            ApprovalOutcome::Unresolved,
            TaskStatus::Failed,
            Some(ReasonCode::ApprovalRequired),
        ),
    ] {
        let approvals = FixedApprovals::new(outcome);
        let supervisor = base_builder(
            ScriptedPlanner::returning(search_graph("plan", "#results")),
            StaticResolver::new(),
            Arc::new(ScriptedSurface::new()),
        )
        .policy(Arc::new(RulePolicyGate::default()))
        .approvals(approvals.clone())
        .build()
        .unwrap();

        let request = TaskRequest::new("look up example.com").risk(RiskLevel::Critical);
        let id = supervisor.submit(request).unwrap();
        let view = supervisor.wait(&id).await.unwrap();

        assert_eq!(view.status, expected);
        assert_eq!(view.failure.map(|f| f.code), code);
        assert_eq!(approvals.requests(), vec![id]);
    }
}

#[tokio::test]
async fn test_planner_failure_is_reported() {
    let supervisor = base_builder(
        ScriptedPlanner::failing("no route to goal"),
        StaticResolver::new(),
        Arc::new(ScriptedSurface::new()),
    )
    .build()
    .unwrap();

    let id = supervisor.submit(TaskRequest::new(SEARCH_GOAL)).unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    let failure = view.failure.unwrap();
    assert_eq!(failure.code, ReasonCode::PlanningFailed);
    assert_eq!(failure.detail, "no route to goal");
}

#[tokio::test]
async fn test_cyclic_plan_is_refused() {
    let cyclic = ActionGraphBuilder::new("loop", "spin")
        .node(ActionNode::extract("a", "#a"))
        .node(ActionNode::extract("b", "#b"))
        .edge("a", "b")
        .edge("b", "a")
        .build_unchecked();
    let surface = Arc::new(ScriptedSurface::new());
    let supervisor = base_builder(ScriptedPlanner::returning(cyclic), StaticResolver::new(), surface.clone())
        .build()
        .unwrap();

    let id = supervisor.submit(TaskRequest::new("spin")).unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    let failure = view.failure.unwrap();
    assert_eq!(failure.code, ReasonCode::MalformedGraph);
    assert!(failure.detail.contains("cycle through [a, b]"), "{}", failure.detail);
    assert_eq!(surface.call_count(), 0);
}

#[tokio::test]
async fn test_budget_exhaustion_preserves_partial_results() {
    let supervisor = base_builder(
        ScriptedPlanner::returning(search_graph("plan", "#results")),
        StaticResolver::new(),
        Arc::new(ScriptedSurface::new()),
    )
    .build()
    .unwrap();

    let id = supervisor
        .submit(TaskRequest::new(SEARCH_GOAL).budget(2))
        .unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.failure.unwrap().code, ReasonCode::BudgetExhausted);
    assert_eq!(view.budget_consumed, 2);
    let executed: Vec<&str> = view
        .records
        .iter()
        .filter(|r| r.status == NodeStatus::Succeeded)
        .map(|r| r.node_id.as_str())
        .collect();
    assert_eq!(executed, vec!["navigate", "locate"]);
    assert!(view.records[2..]
        .iter()
        .all(|r| r.skip_reason == Some(SkipReason::BudgetExhausted)));
}

#[tokio::test]
async fn test_task_deadline_aborts_run() {
    let surface = Arc::new(ScriptedSurface::new().with_delay(Duration::from_millis(60)));
    let supervisor = base_builder(
        ScriptedPlanner::returning(search_graph("plan", "#results")),
        StaticResolver::new(),
        surface,
    )
    .build()
    .unwrap();

    let request = TaskRequest::new(SEARCH_GOAL).timeout(Duration::from_millis(100));
    let id = supervisor.submit(request).unwrap();
    let view = supervisor.wait(&id).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.failure.unwrap().code, ReasonCode::DeadlineExceeded);
    assert_eq!(view.records.len(), 5);
    assert_eq!(view.records[0].status, NodeStatus::Succeeded);
    assert_eq!(view.records[4].status, NodeStatus::Skipped);
}

#[tokio::test]
async fn test_replay_and_stats() {
    let planner = ScriptedPlanner::returning(search_graph("plan", "#results"))
        .then(Err(aura::external::PlanningFailed::new("planner offline")));
    let supervisor = base_builder(planner, StaticResolver::new(), Arc::new(ScriptedSurface::new()))
        .build()
        .unwrap();

    let first = supervisor
        .submit(TaskRequest::new(SEARCH_GOAL).mode(RequestedMode::Dynamic))
        .unwrap();
    supervisor.wait(&first).await.unwrap();

    let replay = supervisor.replay(&first).unwrap();
    assert_ne!(replay, first);
    let view = supervisor.wait(&replay).await.unwrap();
    assert_eq!(view.replay_of.as_deref(), Some(first.as_str()));
    assert_eq!(view.requested_mode, Some(RequestedMode::Dynamic));
    assert_eq!(view.status, TaskStatus::Failed);

    let stats = supervisor.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending + stats.running, 0);
    assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    assert!(stats.avg_execution_ms.is_some());

    assert!(supervisor.replay("missing").is_err());
}

#[tokio::test]
async fn test_worker_pool_is_shared_across_tasks() {
    let config = OrchestratorConfig::builder()
        .max_workers(2)
        .max_concurrent_tasks(3)
        .build()
        .unwrap();
    let surface = Arc::new(ScriptedSurface::new().with_delay(Duration::from_millis(20)));
    let supervisor = base_builder(
        ScriptedPlanner::returning(wide_graph("wide", 4)),
        StaticResolver::new(),
        surface.clone(),
    )
    .config(config)
    .build()
    .unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(supervisor.submit(TaskRequest::new("read everything")).unwrap());
    }
    for id in &ids {
        let view = supervisor.wait(id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Completed);
    }

    assert_eq!(surface.call_count(), 12);
    assert!(surface.peak_concurrency() <= 2);
}

/// Allows the pre-run check and answers `later` on every evaluation after it
struct ChangesMindAfterRun {
    later: PolicyDecision,
    calls: AtomicUsize,
}

impl ChangesMindAfterRun {
    fn new(later: PolicyDecision) -> Self {
        Self {
            later,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PolicyGate for ChangesMindAfterRun {
    async fn evaluate(&self, _task: &TaskView, _graph: &ActionGraph) -> PolicyDecision {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            PolicyDecision::allow()
        } else {
            self.later.clone()
        }
    }
}

#[tokio::test]
async fn test_post_run_audit_blocks_only_on_deny() {
    let audited = OrchestratorConfig::builder()
        .audit_after_run(true)
        .build()
        .unwrap();
    for (later, expected, code) in [
        (
            PolicyDecision::deny("late-objection"),
            TaskStatus::Failed,
            Some(ReasonCode::PolicyDenied),
        ),
        (
            PolicyDecision::require_approval("late-review", "looks risky"),
            TaskStatus::Completed,
            None,
        ),
    ] {
        let policy = Arc::new(ChangesMindAfterRun::new(later));
        let surface = Arc::new(ScriptedSurface::new());
        let supervisor = base_builder(
            ScriptedPlanner::returning(search_graph("plan", "#results")),
            StaticResolver::new(),
            surface.clone(),
        )
        .config(audited.clone())
        .policy(policy.clone())
        .build()
        .unwrap();

        let id = supervisor.submit(TaskRequest::new(SEARCH_GOAL)).unwrap();
        let view = supervisor.wait(&id).await.unwrap();

        assert_eq!(view.status, expected);
        assert_eq!(view.failure.as_ref().map(|f| f.code), code);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 2);
        assert_eq!(surface.call_count(), 5);
        assert_eq!(view.records.len(), 5);
    }

    let policy = Arc::new(ChangesMindAfterRun::new(PolicyDecision::deny("late-objection")));
    let supervisor = base_builder(
        ScriptedPlanner::returning(search_graph("plan", "#results")),
        StaticResolver::new(),
        Arc::new(ScriptedSurface::new()),
    )
    .policy(policy.clone())
    .build()
    .unwrap();
    let id = supervisor.submit(TaskRequest::new(SEARCH_GOAL)).unwrap();
    assert_eq!(supervisor.wait(&id).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(policy.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_oversized_node_costs_still_reach_a_terminal_status() {
    let graph = ActionGraphBuilder::new("heavy", "read both")
        .budget(u64::MAX)
        .node(ActionNode::extract("left", "#left").cost(u64::MAX))
        .node(ActionNode::extract("right", "#right").cost(u64::MAX))
        .build()
        .unwrap();
    let supervisor = base_builder(
        ScriptedPlanner::returning(graph),
        StaticResolver::new(),
        Arc::new(ScriptedSurface::new()),
    )
    .build()
    .unwrap();

    let id = supervisor
        .submit(TaskRequest::new("read both").budget(u64::MAX))
        .unwrap();
    let view = supervisor.wait_timeout(&id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.budget_consumed, u64::MAX);

    let id = supervisor
        .submit(TaskRequest::new("read both").budget(u64::MAX - 1))
        .unwrap();
    let view = supervisor.wait_timeout(&id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.failure.unwrap().code, ReasonCode::BudgetExhausted);
    assert_eq!(view.budget_consumed, 0);
}

struct PanickingPlanner;

#[async_trait]
impl Planner for PanickingPlanner {
    async fn plan(
        &self,
        _goal: &str,
        _constraints: &Constraints,
        _budget: u64,
    ) -> Result<ActionGraph, PlanningFailed> {
        panic!("planner exploded")
    }
}

#[tokio::test]
async fn test_panicking_task_is_failed_as_internal() {
    let supervisor = TaskSupervisor::builder()
        .config(OrchestratorConfig::development())
        .planner(Arc::new(PanickingPlanner))
        .resolver(Arc::new(StaticResolver::new()))
        .surface(Arc::new(ScriptedSurface::new()))
        .build()
        .unwrap();

    let id = supervisor.submit(TaskRequest::new("anything")).unwrap();
    let view = supervisor.wait_timeout(&id, Duration::from_secs(2)).await.unwrap();

    assert_eq!(view.status, TaskStatus::Failed);
    let failure = view.failure.unwrap();
    assert_eq!(failure.code, ReasonCode::Internal);
    assert!(failure.detail.contains("panicked"), "{}", failure.detail);
    assert!(view.completed_at.is_some());
}
