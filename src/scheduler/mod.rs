//! Graph scheduler
//!
//! Runs an action graph layer by layer. Every node of a layer is spawned at
//! once but only runs while holding a slot from the shared worker pool; the
//! next layer starts after the whole layer has finished, because guard
//! evaluation needs every source result.

pub mod events;
pub mod pool;
pub mod result;

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::cancel::CancelToken;
use crate::core::errors::{AuraError, ReasonCode, Result};
use crate::core::limits::{BudgetTracker, LimitCheck};
use crate::exec::{NodeContext, NodeExecutionRecord, NodeExecutor, NodeFailure, NodeStatus, SkipReason};
use crate::graph::{topological_layers, validate, ActionGraph, ActionNode, EdgeGuard};

use events::Emitter;
pub use events::{
    BufferingEventSink, EventSink, FanoutEventSink, LoggingEventSink, RuntimeEvent,
    RuntimeEventEnvelope,
};
pub use pool::WorkerPool;
pub use result::{GraphExecutionResult, GraphFailure, GraphStatus, RunDiagnostics};

/// Per-run options
#[derive(Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub cancel: Option<CancelToken>,
    /// Mark activated nodes SUCCEEDED without touching the surface
    pub dry_run: bool,
    /// Overrides the scheduler's sink for this run
    pub events: Option<Arc<dyn EventSink>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }
}

#[derive(Clone)]
pub struct GraphScheduler {
    executor: NodeExecutor,
    pool: WorkerPool,
    events: Option<Arc<dyn EventSink>>,
}

impl GraphScheduler {
    pub fn new(executor: NodeExecutor, pool: WorkerPool) -> Self {
        Self {
            executor,
            pool,
            events: Some(Arc::new(LoggingEventSink)),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn run(
        &self,
        graph: &ActionGraph,
        budget: u64,
        deadline: Instant,
    ) -> Result<GraphExecutionResult> {
        self.run_with(graph, budget, deadline, RunOptions::default())
            .await
    }

    /// Execute `graph` within `budget` cost units and before `deadline`.
    ///
    /// Only a malformed graph is an `Err`; every execution outcome, including
    /// aborts, is reported in the returned result.
    pub async fn run_with(
        &self,
        graph: &ActionGraph,
        budget: u64,
        deadline: Instant,
        options: RunOptions,
    ) -> Result<GraphExecutionResult> {
        let violations = validate(graph);
        if !violations.is_empty() {
            error!(
                graph_id = %graph.id,
                "Refusing malformed graph: {}",
                violations.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; ")
            );
            return Err(AuraError::malformed_graph(&graph.id, violations));
        }
        let layers = topological_layers(graph)?;

        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| format!("run_{}", cuid2::create_id()));
        let cancel = options.cancel.clone().unwrap_or_else(CancelToken::never);
        let emitter = Emitter::new(&run_id, options.events.clone().or_else(|| self.events.clone()));
        let mut tracker = BudgetTracker::new(budget, deadline);
        let mut records: HashMap<String, NodeExecutionRecord> = HashMap::new();
        let mut abort: Option<(ReasonCode, String)> = None;
        let mut dispatched_layers = 0;

        info!(
            run_id = %run_id,
            graph_id = %graph.id,
            layers = layers.len(),
            nodes = graph.len(),
            budget,
            "Graph run started"
        );
        emitter.emit(RuntimeEvent::RunStarted {
            graph_id: graph.id.clone(),
            layers: layers.len(),
            nodes: graph.len(),
        });

        for (layer_idx, layer) in layers.iter().enumerate() {
            let mut ready = Vec::with_capacity(layer.len());
            for node_id in layer {
                if let Some((code, _)) = &abort {
                    let reason = SkipReason::from_abort(*code).unwrap_or(SkipReason::Cancelled);
                    skip(&mut records, &emitter, node_id, reason);
                } else if is_activated(graph, node_id, &records) {
                    ready.push(node_id.as_str());
                } else {
                    skip(&mut records, &emitter, node_id, SkipReason::GuardInactive);
                }
            }
            if ready.is_empty() {
                continue;
            }

            let check = if cancel.is_cancelled() {
                Some((ReasonCode::Cancelled, "cancellation requested".to_string()))
            } else {
                let cost: u64 = ready
                    .iter()
                    .filter_map(|id| graph.node(id))
                    .map(|n| n.cost)
                    .fold(0, u64::saturating_add);
                match tracker.check(cost) {
                    LimitCheck::Within => None,
                    limit => limit.reason_code().map(|code| (code, limit.describe())),
                }
            };
            if let Some((code, detail)) = check {
                warn!(run_id = %run_id, layer = layer_idx, %code, "Aborting run: {}", detail);
                emitter.emit(RuntimeEvent::RunAborted {
                    reason: code,
                    detail: detail.clone(),
                });
                let reason = SkipReason::from_abort(code).unwrap_or(SkipReason::Cancelled);
                for node_id in &ready {
                    skip(&mut records, &emitter, node_id, reason);
                }
                abort = Some((code, detail));
                continue;
            }

            debug!(run_id = %run_id, layer = layer_idx, nodes = ?ready, "Dispatching layer");
            emitter.emit(RuntimeEvent::LayerDispatched {
                layer: layer_idx,
                nodes: ready.iter().map(|s| s.to_string()).collect(),
            });
            dispatched_layers += 1;

            let batch: Vec<&ActionNode> = ready.iter().filter_map(|id| graph.node(id)).collect();
            let handles: Vec<_> = batch
                .iter()
                .map(|&node| {
                    let node = node.clone();
                    let executor = self.executor.clone();
                    let pool = self.pool.clone();
                    let emitter = emitter.clone();
                    let ctx = NodeContext::new(run_id.clone(), graph.id.clone(), cancel.clone());
                    let dry_run = options.dry_run;
                    tokio::spawn(async move {
                        let Some(_permit) = pool.acquire().await else {
                            let mut record = NodeExecutionRecord::pending(&node.id);
                            record.status = NodeStatus::Failed;
                            record.last_error =
                                Some(NodeFailure::new(ReasonCode::Internal, "worker pool closed"));
                            return record;
                        };
                        if ctx.cancel.is_cancelled() {
                            return NodeExecutionRecord::skipped(&node.id, SkipReason::Cancelled);
                        }
                        emitter.emit(RuntimeEvent::NodeStarted {
                            node_id: node.id.clone(),
                            kind: node.kind,
                        });
                        if dry_run {
                            NodeExecutionRecord::dry_run(&node.id)
                        } else {
                            executor.execute(&node, &ctx).await
                        }
                    })
                })
                .collect();

            for (node, joined) in batch.into_iter().zip(join_all(handles).await) {
                let record = joined.unwrap_or_else(|e| {
                    error!(run_id = %run_id, node_id = %node.id, "Node worker panicked: {}", e);
                    let mut record = NodeExecutionRecord::pending(&node.id);
                    record.status = NodeStatus::Failed;
                    record.last_error = Some(NodeFailure::new(
                        ReasonCode::Internal,
                        format!("worker aborted: {}", e),
                    ));
                    record
                });
                tracker.charge(node.cost.saturating_mul(record.attempts as u64));
                match record.status {
                    NodeStatus::Skipped => emitter.emit(RuntimeEvent::NodeSkipped {
                        node_id: record.node_id.clone(),
                        reason: record.skip_reason.unwrap_or(SkipReason::Cancelled),
                    }),
                    status => emitter.emit(RuntimeEvent::NodeCompleted {
                        node_id: record.node_id.clone(),
                        status,
                        attempts: record.attempts,
                        code: record.last_error.as_ref().map(|f| f.code),
                    }),
                }
                records.insert(node.id.clone(), record);
            }
        }

        if abort.is_none() && cancel.is_cancelled() {
            abort = Some((
                ReasonCode::Cancelled,
                "cancellation requested during the final layer".to_string(),
            ));
        }

        let ordered: Vec<NodeExecutionRecord> = graph
            .nodes
            .iter()
            .filter_map(|n| records.remove(&n.id))
            .collect();
        let failure = graph_failure(graph, &ordered, abort);
        let status = if failure.is_none() {
            GraphStatus::Succeeded
        } else {
            GraphStatus::Failed
        };

        let diagnostics = RunDiagnostics {
            layers: layers.len(),
            dispatched_layers,
            succeeded: ordered.iter().filter(|r| r.status == NodeStatus::Succeeded).count(),
            failed: ordered.iter().filter(|r| r.status == NodeStatus::Failed).count(),
            skipped: ordered.iter().filter(|r| r.status == NodeStatus::Skipped).count(),
            retries: ordered.iter().map(|r| r.retries()).sum(),
            budget,
            budget_consumed: tracker.consumed(),
            elapsed_ms: tracker.elapsed().as_millis() as u64,
            artifacts: ordered.iter().filter_map(|r| r.artifact.clone()).collect(),
            dry_run: options.dry_run,
        };

        match &failure {
            None => info!(
                run_id = %run_id,
                graph_id = %graph.id,
                elapsed_ms = diagnostics.elapsed_ms,
                "Graph run succeeded"
            ),
            Some(f) => warn!(run_id = %run_id, graph_id = %graph.id, "Graph run failed: {}", f),
        }
        emitter.emit(RuntimeEvent::RunFinished {
            status,
            elapsed_ms: diagnostics.elapsed_ms,
        });

        Ok(GraphExecutionResult {
            graph_id: graph.id.clone(),
            run_id,
            status,
            records: ordered,
            failure,
            diagnostics,
        })
    }
}

fn skip(
    records: &mut HashMap<String, NodeExecutionRecord>,
    emitter: &Emitter,
    node_id: &str,
    reason: SkipReason,
) {
    emitter.emit(RuntimeEvent::NodeSkipped {
        node_id: node_id.to_string(),
        reason,
    });
    records.insert(node_id.to_string(), NodeExecutionRecord::skipped(node_id, reason));
}

/// Roots are always active; otherwise at least one incoming edge must fire.
/// An edge fires only if its source actually ran and the guard matches.
fn is_activated(
    graph: &ActionGraph,
    node_id: &str,
    records: &HashMap<String, NodeExecutionRecord>,
) -> bool {
    let mut incoming = graph.incoming(node_id).peekable();
    if incoming.peek().is_none() {
        return true;
    }
    incoming.any(|edge| match records.get(&edge.from) {
        Some(source) if source.executed() => match edge.guard {
            EdgeGuard::Always => true,
            EdgeGuard::OnSuccess => source.succeeded(),
            EdgeGuard::OnFailure => source.failed(),
        },
        _ => false,
    })
}

/// `None` when the run succeeded.
///
/// A failed node is tolerated when the graph gives it an on-failure branch.
/// An abort always fails the run. Among untolerated failures an unresolvable
/// target means the graph no longer fits the page.
fn graph_failure(
    graph: &ActionGraph,
    records: &[NodeExecutionRecord],
    abort: Option<(ReasonCode, String)>,
) -> Option<GraphFailure> {
    if let Some((code, detail)) = abort {
        return Some(GraphFailure {
            code,
            detail,
            node_id: None,
        });
    }

    let unhandled: Vec<&NodeExecutionRecord> = records
        .iter()
        .filter(|r| r.status == NodeStatus::Failed && !graph.has_failure_branch(&r.node_id))
        .collect();

    let unresolvable = unhandled.iter().find_map(|r| {
        r.last_error
            .as_ref()
            .filter(|f| f.code == ReasonCode::Unresolvable)
            .map(|f| (r, f))
    });
    if let Some((record, failure)) = unresolvable {
        return Some(GraphFailure {
            code: ReasonCode::StructuralMismatch,
            detail: format!("node '{}' could not locate its target: {}", record.node_id, failure.detail),
            node_id: Some(record.node_id.clone()),
        });
    }

    unhandled.first().map(|record| match &record.last_error {
        Some(failure) => GraphFailure {
            code: failure.code,
            detail: format!("node '{}' failed: {}", record.node_id, failure.detail),
            node_id: Some(record.node_id.clone()),
        },
        None => GraphFailure {
            code: ReasonCode::NodeFailed,
            detail: format!("node '{}' failed without a recorded error", record.node_id),
            node_id: Some(record.node_id.clone()),
        },
    })
}
