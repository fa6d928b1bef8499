//! Aura: task orchestration over action graphs
//!
//! A goal is routed either to a stored procedure (deterministic mode) or to a
//! planner (dynamic mode). Either way it becomes an [`ActionGraph`], which the
//! [`GraphScheduler`] runs layer by layer over a shared worker pool, one
//! [`NodeExecutor`] call per node. The [`TaskSupervisor`] owns the task
//! lifecycle, the policy gate and the one-shot fallback from deterministic to
//! dynamic execution.

// Core infrastructure shared by every component
pub mod core;

pub mod exec;
pub mod external;
pub mod graph;
pub mod router;
pub mod scheduler;
pub mod supervisor;

// Scripted collaborators for tests and dry runs
pub mod testing;

pub use crate::core::{init_tracing, AuraError, OrchestratorConfig, ReasonCode, Result};
pub use exec::{NodeExecutionRecord, NodeExecutor, NodeStatus};
pub use graph::{
    topological_layers, validate, ActionEdge, ActionGraph, ActionGraphBuilder, ActionNode,
    EdgeGuard, GraphViolation, OperationKind, TargetDescriptor,
};
pub use router::{ExecutionMode, RoutingDecision, StrategyRouter};
pub use scheduler::{GraphExecutionResult, GraphScheduler, GraphStatus, RunOptions, WorkerPool};
pub use supervisor::{
    CancelAck, RiskLevel, TaskRequest, TaskStatus, TaskSupervisor, TaskView,
};
