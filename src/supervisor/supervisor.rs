//! Task lifecycle driver
//!
//! Each submitted task gets one driver future. The driver routes the goal,
//! obtains a graph from the procedure library or the planner, consults the
//! policy gate and hands the graph to the shared scheduler. Terminal state is
//! published through the store, which wakes every `wait` caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use super::store::TaskStore;
use super::task::{TaskEvent, TaskFailure, TaskPhase, TaskRequest, TaskStatus, TaskView};
use crate::core::cancel::CancelToken;
use crate::core::config::OrchestratorConfig;
use crate::core::errors::{AuraError, ReasonCode, Result};
use crate::exec::{HandlerTable, NodeExecutor};
use crate::external::{
    AllowAllPolicy, ApprovalHandler, ApprovalOutcome, Constraints, ExecutionSurface,
    InMemoryProcedureLibrary, LocatorResolver, ObservabilitySink, Planner, PolicyGate,
    PolicyVerdict, ProcedureError, ProcedureLibrary, ProcedureMatch, ProcedureMatcher,
};
use crate::graph::ActionGraph;
use crate::router::{ExecutionMode, RequestedMode, RouteRequest, RoutingDecision, StrategyRouter};
use crate::scheduler::{
    EventSink, FanoutEventSink, GraphExecutionResult, GraphScheduler, LoggingEventSink,
    RunOptions, RuntimeEvent, RuntimeEventEnvelope, WorkerPool,
};

/// Answer to a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// The task will stop at its next checkpoint
    Accepted,
    AlreadyTerminal,
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub degraded: usize,
    /// Completed over completed plus failed; cancelled tasks are left out.
    /// 0 when neither has happened yet
    pub success_rate: f64,
    /// Mean RUNNING -> COMPLETED time of completed tasks
    pub avg_execution_ms: Option<f64>,
}

/// Supervises concurrent tasks over one shared worker pool
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    store: TaskStore,
    router: StrategyRouter,
    scheduler: GraphScheduler,
    matcher: Arc<dyn ProcedureMatcher>,
    library: Arc<dyn ProcedureLibrary>,
    planner: Arc<dyn Planner>,
    policy: Arc<dyn PolicyGate>,
    approvals: Option<Arc<dyn ApprovalHandler>>,
    task_slots: Arc<Semaphore>,
    event_sink: Arc<dyn EventSink>,
}

enum Outcome {
    Completed(Value),
    Failed(TaskFailure),
    Cancelled(String),
}

impl Outcome {
    fn failed(code: ReasonCode, detail: impl Into<String>) -> Self {
        Self::Failed(TaskFailure::new(code, detail))
    }
}

impl TaskSupervisor {
    pub fn builder() -> TaskSupervisorBuilder {
        TaskSupervisorBuilder::new()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Register a task and start driving it. Returns the new task id.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, request: TaskRequest) -> Result<String> {
        self.submit_inner(request, None)
    }

    fn submit_inner(&self, request: TaskRequest, replay_of: Option<String>) -> Result<String> {
        if request.goal.trim().is_empty() {
            return Err(AuraError::validation_field("goal must not be empty", "goal"));
        }
        if self.inner.task_slots.is_closed() {
            return Err(AuraError::internal("supervisor has been shut down"));
        }

        let mut view = TaskView::pending(request);
        view.replay_of = replay_of;
        let task_id = view.id.clone();
        info!(
            task_id = %task_id,
            risk = ?view.risk,
            budget = view.budget,
            "Task submitted: {}",
            view.goal
        );
        self.inner.store.insert(view);

        tokio::spawn(drive(self.inner.clone(), task_id.clone()));
        Ok(task_id)
    }

    pub fn get_status(&self, task_id: &str) -> Option<TaskView> {
        self.inner.store.view(task_id)
    }

    /// Snapshots of every known task, without event logs
    pub fn tasks(&self) -> Vec<TaskView> {
        self.inner.store.views()
    }

    /// Internal phase of a RUNNING task
    pub fn phase(&self, task_id: &str) -> Option<TaskPhase> {
        self.inner.store.phase(task_id)
    }

    /// Request cooperative cancellation.
    ///
    /// Nodes already dispatched finish their current attempt; no new layer is
    /// dispatched afterwards.
    pub fn cancel(&self, task_id: &str) -> CancelAck {
        let store = &self.inner.store;
        let Some(view) = store.view(task_id) else {
            return CancelAck::NotFound;
        };
        if view.is_terminal() {
            return CancelAck::AlreadyTerminal;
        }
        if let Some(handle) = store.cancel_handle(task_id) {
            if handle.cancel() {
                info!(task_id, "Cancellation requested");
                store.record_event(task_id, TaskEvent::new("cancel_requested", ""));
            }
        }
        CancelAck::Accepted
    }

    /// Resolve once the task reaches a terminal status
    pub async fn wait(&self, task_id: &str) -> Result<TaskView> {
        let mut rx = self
            .inner
            .store
            .subscribe(task_id)
            .ok_or_else(|| AuraError::task_not_found(task_id))?;
        rx.wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| AuraError::internal(format!("status channel for task {} closed", task_id)))?;
        self.get_status(task_id)
            .ok_or_else(|| AuraError::task_not_found(task_id))
    }

    /// Like `wait`, giving up after `limit`
    pub async fn wait_timeout(&self, task_id: &str, limit: Duration) -> Result<TaskView> {
        tokio::time::timeout(limit, self.wait(task_id))
            .await
            .map_err(|_| {
                AuraError::internal(format!("task {} did not finish within {:?}", task_id, limit))
            })?
    }

    /// Resubmit the request of an existing task as a new task
    pub fn replay(&self, task_id: &str) -> Result<String> {
        let original = self
            .get_status(task_id)
            .ok_or_else(|| AuraError::task_not_found(task_id))?;
        info!(task_id, "Replaying task");
        self.submit_inner(original.request(), Some(original.id))
    }

    pub fn stats(&self) -> SupervisorStats {
        let views = self.inner.store.views();
        let mut stats = SupervisorStats {
            total: views.len(),
            ..Default::default()
        };
        let mut execution_ms = Vec::new();
        for view in &views {
            match view.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => {
                    stats.completed += 1;
                    execution_ms.extend(view.execution_ms());
                }
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            if view.degraded {
                stats.degraded += 1;
            }
        }

        let decided = stats.completed + stats.failed;
        if decided > 0 {
            stats.success_rate = stats.completed as f64 / decided as f64;
        }
        if !execution_ms.is_empty() {
            let sum: i64 = execution_ms.iter().sum();
            stats.avg_execution_ms = Some(sum as f64 / execution_ms.len() as f64);
        }
        stats
    }

    /// Stop accepting tasks, cancel the live ones and wait until each is terminal
    pub async fn shutdown(&self) {
        info!("Shutting down task supervisor");
        self.inner.task_slots.close();
        let live: Vec<String> = self
            .inner
            .store
            .views()
            .into_iter()
            .filter(|v| !v.is_terminal())
            .map(|v| v.id)
            .collect();
        for id in &live {
            self.cancel(id);
        }
        for id in &live {
            if let Err(err) = self.wait(id).await {
                error!(task_id = %id, "Task did not settle during shutdown: {}", err);
            }
        }
    }
}

async fn drive(inner: Arc<Inner>, task_id: String) {
    let Some(cancel) = inner.store.cancel_handle(&task_id) else {
        return;
    };
    let token = cancel.token();

    let slot: Option<OwnedSemaphorePermit> = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        permit = inner.task_slots.clone().acquire_owned() => permit.ok(),
    };

    inner.store.transition(&task_id, TaskStatus::Running, |_| {});
    let outcome = match slot {
        None if token.is_cancelled() => Outcome::Cancelled("cancelled before dispatch".to_string()),
        None => Outcome::Cancelled("supervisor shut down before dispatch".to_string()),
        Some(_) if token.is_cancelled() => {
            Outcome::Cancelled("cancelled before dispatch".to_string())
        }
        Some(_) => {
            info!(task_id = %task_id, "Task dispatched");
            let worker = {
                let inner = inner.clone();
                let task_id = task_id.clone();
                let token = token.clone();
                tokio::spawn(async move { inner.execute(&task_id, &token).await })
            };
            match worker.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(task_id = %task_id, "Task execution aborted: {}", err);
                    Outcome::failed(ReasonCode::Internal, format!("task execution aborted: {}", err))
                }
            }
        }
    };
    inner.finish(&task_id, outcome);
    drop(slot);
}

impl Inner {
    async fn execute(&self, task_id: &str, token: &CancelToken) -> Outcome {
        let Some(task) = self.store.view(task_id) else {
            return Outcome::failed(ReasonCode::Internal, "task vanished from the store");
        };
        let timeout_ms = task.timeout_ms.unwrap_or(self.config.default_task_timeout_ms);
        let task_deadline = Instant::now() + Duration::from_millis(timeout_ms);

        self.store.set_phase(task_id, TaskPhase::Routing);
        let candidates = self.candidates(task_id, &task).await;
        if token.is_cancelled() {
            return Outcome::Cancelled("cancelled while routing".to_string());
        }

        let request =
            RouteRequest::with_constraints(&task.goal, &task.constraints).requested(task.requested_mode);
        let mut decision = self.route(&request, &candidates);
        let mut fallback_used = false;

        loop {
            self.store.update(task_id, |v| v.mode = Some(decision.mode.clone()));
            self.store.record_event(
                task_id,
                TaskEvent::new("routed", format!("{}: {}", decision.mode, decision.rationale)),
            );
            info!(task_id, mode = %decision.mode, "Routed: {}", decision.rationale);

            self.store.set_phase(task_id, TaskPhase::Planning);
            let remaining = self
                .store
                .view(task_id)
                .map_or(task.budget, |v| v.remaining_budget());
            let graph = match decision.mode.clone() {
                ExecutionMode::Deterministic { procedure_id } => {
                    match self.library.get_graph(&procedure_id, &task.constraints).await {
                        Ok(graph) => graph,
                        Err(err) if !fallback_used => {
                            fallback_used = true;
                            self.degrade(task_id, &err.to_string());
                            decision = self.route(&request.clone().fallback(), &candidates);
                            continue;
                        }
                        Err(err) => return procedure_unavailable(err),
                    }
                }
                ExecutionMode::Dynamic => {
                    match self.planner.plan(&task.goal, &task.constraints, remaining).await {
                        Ok(graph) => graph,
                        Err(err) => return Outcome::failed(ReasonCode::PlanningFailed, err.reason),
                    }
                }
            };
            debug!(
                task_id,
                graph_id = %graph.id,
                nodes = graph.len(),
                cost = graph.total_cost(),
                "Graph obtained"
            );
            if token.is_cancelled() {
                return Outcome::Cancelled("cancelled while planning".to_string());
            }

            self.store.set_phase(task_id, TaskPhase::Gating);
            if let Some(refusal) = self.gate(task_id, &graph).await {
                return refusal;
            }
            if token.is_cancelled() {
                return Outcome::Cancelled("cancelled at the policy gate".to_string());
            }

            self.store.set_phase(task_id, TaskPhase::Executing);
            let result = match self.run_graph(task_id, &graph, remaining, task_deadline, token).await {
                Ok(result) => result,
                Err(err) => return Outcome::failed(err.reason_code(), describe_run_error(&err)),
            };

            if let Some(procedure_id) = decision.mode.procedure_id() {
                self.library.record_outcome(procedure_id, result.succeeded());
            }
            self.store.update(task_id, |v| {
                v.records = result.records.clone();
                v.budget_consumed = v.budget_consumed.saturating_add(result.diagnostics.budget_consumed);
            });

            if result.succeeded() {
                if self.config.audit_after_run {
                    if let Some(refusal) = self.audit(task_id, &graph).await {
                        return refusal;
                    }
                }
                return Outcome::Completed(collect_results(&result));
            }
            if result.was_cancelled() {
                return Outcome::Cancelled("cancelled during execution".to_string());
            }

            let Some(failure) = result.failure else {
                return Outcome::failed(ReasonCode::Internal, "graph failed without a reason");
            };
            if failure.code == ReasonCode::StructuralMismatch
                && decision.mode.is_deterministic()
                && !fallback_used
            {
                fallback_used = true;
                self.degrade(task_id, &failure.to_string());
                decision = self.route(&request.clone().fallback(), &candidates);
                continue;
            }
            return Outcome::failed(failure.code, failure.to_string());
        }
    }

    async fn candidates(&self, task_id: &str, task: &TaskView) -> Vec<ProcedureMatch> {
        if task.requested_mode == Some(RequestedMode::Dynamic) {
            return Vec::new();
        }
        match self.matcher.match_goal(&task.goal, &task.constraints).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(task_id, "Procedure matcher failed, routing without candidates: {:#}", err);
                self.store
                    .record_event(task_id, TaskEvent::new("matcher_failed", format!("{:#}", err)));
                Vec::new()
            }
        }
    }

    fn route(&self, request: &RouteRequest<'_>, candidates: &[ProcedureMatch]) -> RoutingDecision {
        self.router
            .decide_with_stats(request, candidates, |id| self.library.success_rate(id))
    }

    /// Switch to the one-shot dynamic fallback
    fn degrade(&self, task_id: &str, reason: &str) {
        warn!(task_id, "Deterministic attempt failed, degrading to dynamic planning: {}", reason);
        self.store.set_phase(task_id, TaskPhase::Degrading);
        self.store.update(task_id, |v| v.degraded = true);
        self.store
            .record_event(task_id, TaskEvent::new("degraded", reason.to_string()));
    }

    /// `None` lets execution proceed
    async fn gate(&self, task_id: &str, graph: &ActionGraph) -> Option<Outcome> {
        let view = self.store.view(task_id)?;
        let decision = self.policy.evaluate(&view, graph).await;
        self.store
            .record_event(task_id, TaskEvent::new("policy", decision.to_string()));

        match decision.verdict {
            PolicyVerdict::Allow => None,
            PolicyVerdict::Deny => {
                warn!(task_id, "Policy denied execution: {}", decision);
                Some(Outcome::failed(ReasonCode::PolicyDenied, decision.to_string()))
            }
            PolicyVerdict::RequireApproval => {
                let Some(approvals) = &self.approvals else {
                    warn!(task_id, "Approval required but no approval handler is configured");
                    return Some(Outcome::failed(ReasonCode::ApprovalRequired, decision.to_string()));
                };
                let outcome = approvals.request_approval(&view, graph, &decision).await;
                self.store.record_event(
                    task_id,
                    TaskEvent::new("approval", format!("{:?}", outcome).to_lowercase()),
                );
                match outcome {
                    ApprovalOutcome::Approved => None,
                    ApprovalOutcome::Rejected => Some(Outcome::failed(
                        ReasonCode::PolicyDenied,
                        format!("approval rejected: {}", decision),
                    )),
                    ApprovalOutcome::Unresolved => Some(Outcome::failed(
                        ReasonCode::ApprovalRequired,
                        format!("approval unresolved: {}", decision),
                    )),
                }
            }
        }
    }

    /// Post-hoc policy re-check before COMPLETED
    async fn audit(&self, task_id: &str, graph: &ActionGraph) -> Option<Outcome> {
        let view = self.store.view(task_id)?;
        let decision = self.policy.evaluate(&view, graph).await;
        match decision.verdict {
            PolicyVerdict::Deny => {
                warn!(task_id, "Post-run audit objected: {}", decision);
                Some(Outcome::failed(
                    ReasonCode::PolicyDenied,
                    format!("post-run audit: {}", decision),
                ))
            }
            _ => None,
        }
    }

    async fn run_graph(
        &self,
        task_id: &str,
        graph: &ActionGraph,
        remaining: u64,
        task_deadline: Instant,
        token: &CancelToken,
    ) -> Result<GraphExecutionResult> {
        let budget = remaining.min(graph.budget);
        let deadline = task_deadline.min(Instant::now() + graph.deadline);
        self.store.update(task_id, |v| v.graph_id = Some(graph.id.clone()));

        let task_sink: Arc<dyn EventSink> = Arc::new(TaskEventSink {
            store: self.store.clone(),
            task_id: task_id.to_string(),
        });
        let sink = Arc::new(FanoutEventSink::new(vec![task_sink, self.event_sink.clone()]));
        let options = RunOptions::new().cancel(token.clone()).events(sink);
        self.scheduler.run_with(graph, budget, deadline, options).await
    }

    fn finish(&self, task_id: &str, outcome: Outcome) {
        match outcome {
            Outcome::Completed(result) => {
                info!(task_id, "Task completed");
                self.store
                    .transition(task_id, TaskStatus::Completed, |v| v.result = Some(result));
            }
            Outcome::Failed(failure) => {
                error!(task_id, code = %failure.code, "Task failed: {}", failure.detail);
                self.store
                    .transition(task_id, TaskStatus::Failed, |v| v.failure = Some(failure));
            }
            Outcome::Cancelled(detail) => {
                info!(task_id, "Task cancelled: {}", detail);
                self.store.transition(task_id, TaskStatus::Cancelled, |v| {
                    v.failure = Some(TaskFailure::new(ReasonCode::Cancelled, detail))
                });
            }
        }
    }
}

/// Error text with every graph violation spelled out
fn describe_run_error(err: &AuraError) -> String {
    let violations = err.violations();
    if violations.is_empty() {
        return err.to_string();
    }
    let listed: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
    format!("{}: {}", err, listed.join("; "))
}

fn procedure_unavailable(err: ProcedureError) -> Outcome {
    Outcome::failed(ReasonCode::ProcedureUnavailable, err.to_string())
}

/// Results of succeeded nodes keyed by node id
fn collect_results(result: &GraphExecutionResult) -> Value {
    let map: Map<String, Value> = result
        .records
        .iter()
        .filter(|r| r.succeeded())
        .filter_map(|r| r.result.clone().map(|v| (r.node_id.clone(), v)))
        .collect();
    Value::Object(map)
}

/// Appends a summary of each runtime event to the task's log
struct TaskEventSink {
    store: TaskStore,
    task_id: String,
}

impl EventSink for TaskEventSink {
    fn emit(&self, envelope: &RuntimeEventEnvelope) {
        let summary = match &envelope.event {
            RuntimeEvent::RunStarted { graph_id, layers, nodes } => Some((
                "run_started",
                format!("{} ({} nodes in {} layers)", graph_id, nodes, layers),
            )),
            RuntimeEvent::NodeCompleted {
                node_id,
                status,
                attempts,
                code,
            } => Some((
                "node_completed",
                match code {
                    Some(code) => format!("{} {:?} after {} attempt(s): {}", node_id, status, attempts, code),
                    None => format!("{} {:?} after {} attempt(s)", node_id, status, attempts),
                },
            )),
            RuntimeEvent::NodeSkipped { node_id, reason } => {
                Some(("node_skipped", format!("{} ({:?})", node_id, reason)))
            }
            RuntimeEvent::RunAborted { reason, detail } => {
                Some(("run_aborted", format!("{}: {}", reason, detail)))
            }
            RuntimeEvent::RunFinished { status, elapsed_ms } => {
                Some(("run_finished", format!("{:?} in {}ms", status, elapsed_ms)))
            }
            RuntimeEvent::LayerDispatched { .. } | RuntimeEvent::NodeStarted { .. } => None,
        };
        if let Some((event, detail)) = summary {
            self.store.record_event(&self.task_id, TaskEvent::new(event, detail));
        }
    }
}

/// Routes everything to the planner
struct NoProcedures;

#[async_trait]
impl ProcedureMatcher for NoProcedures {
    async fn match_goal(
        &self,
        _goal: &str,
        _constraints: &Constraints,
    ) -> anyhow::Result<Vec<ProcedureMatch>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl ProcedureLibrary for NoProcedures {
    async fn get_graph(
        &self,
        procedure_id: &str,
        _parameters: &Constraints,
    ) -> std::result::Result<ActionGraph, ProcedureError> {
        Err(ProcedureError::NotFound {
            procedure_id: procedure_id.to_string(),
        })
    }
}

pub struct TaskSupervisorBuilder {
    config: OrchestratorConfig,
    planner: Option<Arc<dyn Planner>>,
    resolver: Option<Arc<dyn LocatorResolver>>,
    surface: Option<Arc<dyn ExecutionSurface>>,
    matcher: Option<Arc<dyn ProcedureMatcher>>,
    library: Option<Arc<dyn ProcedureLibrary>>,
    policy: Option<Arc<dyn PolicyGate>>,
    approvals: Option<Arc<dyn ApprovalHandler>>,
    observability: Option<Arc<dyn ObservabilitySink>>,
    event_sink: Option<Arc<dyn EventSink>>,
    handlers: Option<HandlerTable>,
}

impl TaskSupervisorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            planner: None,
            resolver: None,
            surface: None,
            matcher: None,
            library: None,
            policy: None,
            approvals: None,
            observability: None,
            event_sink: None,
            handlers: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn LocatorResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn surface(mut self, surface: Arc<dyn ExecutionSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn matcher(mut self, matcher: Arc<dyn ProcedureMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn library(mut self, library: Arc<dyn ProcedureLibrary>) -> Self {
        self.library = Some(library);
        self
    }

    /// Use an in-memory library as both matcher and library
    pub fn procedures(mut self, procedures: Arc<InMemoryProcedureLibrary>) -> Self {
        self.matcher = Some(procedures.clone());
        self.library = Some(procedures);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicyGate>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn approvals(mut self, approvals: Arc<dyn ApprovalHandler>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn observability(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.observability = Some(sink);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn build(self) -> Result<TaskSupervisor> {
        self.config.validate()?;
        let planner = self
            .planner
            .ok_or_else(|| AuraError::configuration_field("a planner is required", "planner"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| AuraError::configuration_field("a locator resolver is required", "resolver"))?;
        let surface = self
            .surface
            .ok_or_else(|| AuraError::configuration_field("an execution surface is required", "surface"))?;

        let mut executor = NodeExecutor::new(resolver, surface).configured(&self.config);
        if let Some(handlers) = self.handlers {
            executor = executor.with_handlers(handlers);
        }
        if let Some(sink) = self.observability {
            executor = executor.with_observability(sink);
        }
        let scheduler = GraphScheduler::new(executor, WorkerPool::new(self.config.max_workers));

        let no_procedures = Arc::new(NoProcedures);
        let inner = Inner {
            store: TaskStore::new(self.config.task_event_log_capacity),
            router: StrategyRouter::new(self.config.router.clone()),
            scheduler,
            matcher: self.matcher.unwrap_or_else(|| no_procedures.clone()),
            library: self.library.unwrap_or(no_procedures),
            planner,
            policy: self.policy.unwrap_or_else(|| Arc::new(AllowAllPolicy)),
            approvals: self.approvals,
            task_slots: Arc::new(Semaphore::new(self.config.max_concurrent_tasks)),
            event_sink: self
                .event_sink
                .unwrap_or_else(|| Arc::new(LoggingEventSink)),
            config: self.config,
        };
        info!(
            max_workers = inner.config.max_workers,
            max_concurrent_tasks = inner.config.max_concurrent_tasks,
            "Task supervisor ready"
        );
        Ok(TaskSupervisor {
            inner: Arc::new(inner),
        })
    }
}

impl Default for TaskSupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ActionGraphBuilder, ActionNode};
    use crate::testing::{ScriptedPlanner, ScriptedSurface, StaticResolver};
    use pretty_assertions::assert_eq;

    fn two_step() -> ActionGraph {
        ActionGraphBuilder::new("g", "open and read")
            .chain(vec![
                ActionNode::navigate("open", "https://example.com"),
                ActionNode::extract("read", "#content"),
            ])
            .build()
            .unwrap()
    }

    fn supervisor(planner: ScriptedPlanner) -> TaskSupervisor {
        TaskSupervisor::builder()
            .config(OrchestratorConfig::development())
            .planner(Arc::new(planner))
            .resolver(Arc::new(StaticResolver::new()))
            .surface(Arc::new(ScriptedSurface::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_collaborators() {
        let err = TaskSupervisor::builder()
            .resolver(Arc::new(StaticResolver::new()))
            .surface(Arc::new(ScriptedSurface::new()))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn test_empty_goal_is_rejected() {
        let sup = supervisor(ScriptedPlanner::returning(two_step()));
        let err = sup.submit(TaskRequest::new("   ")).unwrap_err();
        assert!(matches!(err, AuraError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_completed_task_carries_node_results() {
        let sup = supervisor(ScriptedPlanner::returning(two_step()));
        let id = sup.submit(TaskRequest::new("open and read")).unwrap();
        let view = sup.wait(&id).await.unwrap();

        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.mode, Some(ExecutionMode::Dynamic));
        assert_eq!(view.budget_consumed, 2);
        let result = view.result.unwrap();
        assert!(result.get("open").is_some());
        assert!(result.get("read").is_some());
        assert!(view.events.iter().any(|e| e.event == "run_finished"));
        assert!(sup.phase(&id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_terminal_and_unknown() {
        let sup = supervisor(ScriptedPlanner::failing("nothing to do"));
        assert_eq!(sup.cancel("missing"), CancelAck::NotFound);

        let id = sup.submit(TaskRequest::new("anything")).unwrap();
        let view = sup.wait(&id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.failure.unwrap().code, ReasonCode::PlanningFailed);
        assert_eq!(sup.cancel(&id), CancelAck::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_wait_unknown_task() {
        let sup = supervisor(ScriptedPlanner::returning(two_step()));
        let err = sup.wait("nope").await.unwrap_err();
        assert!(matches!(err, AuraError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let sup = supervisor(ScriptedPlanner::returning(two_step()));
        let id = sup.submit(TaskRequest::new("open and read")).unwrap();
        sup.shutdown().await;
        assert!(sup.get_status(&id).unwrap().is_terminal());
        assert!(sup.submit(TaskRequest::new("again")).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_settles_in_flight_tasks() {
        let sup = TaskSupervisor::builder()
            .config(OrchestratorConfig::development())
            .planner(Arc::new(ScriptedPlanner::returning(two_step())))
            .resolver(Arc::new(StaticResolver::new()))
            .surface(Arc::new(
                ScriptedSurface::new().with_delay(Duration::from_millis(50)),
            ))
            .build()
            .unwrap();
        let finished = sup.submit(TaskRequest::new("open and read")).unwrap();
        sup.wait(&finished).await.unwrap();

        let ids: Vec<String> = (0..3)
            .map(|_| sup.submit(TaskRequest::new("open and read")).unwrap())
            .collect();
        tokio::time::timeout(Duration::from_secs(2), sup.shutdown())
            .await
            .unwrap();

        for id in &ids {
            let view = sup.get_status(id).unwrap();
            assert_eq!(view.status, TaskStatus::Cancelled, "{}", id);
        }
        assert_eq!(sup.get_status(&finished).unwrap().status, TaskStatus::Completed);
    }
}
