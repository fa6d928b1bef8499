//! Collaborator contracts
//!
//! Everything the orchestration core consumes but does not own: procedure
//! matching and storage, planning, locator resolution, the execution surface,
//! policy evaluation, approvals and diagnostic capture. Reference in-memory
//! implementations live in the submodules.

pub mod observability;
pub mod policy;
pub mod procedures;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::core::errors::ReasonCode;
use crate::graph::{ActionGraph, OperationKind, TargetDescriptor};
use crate::supervisor::TaskView;

pub use observability::TracingObservabilitySink;
pub use policy::{AllowAllPolicy, PolicyRule, RuleCondition, RulePolicyGate};
pub use procedures::{InMemoryProcedureLibrary, ProcedureTemplate};

/// Opaque key-value constraints and parameters attached to a goal
pub type Constraints = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Procedures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureMatch {
    pub procedure_id: String,
    /// Match confidence in [0, 1]
    pub confidence: f64,
    /// Domain the procedure was authored for, `*` for any
    pub declared_domain: String,
}

impl ProcedureMatch {
    pub fn new(
        procedure_id: impl Into<String>,
        confidence: f64,
        declared_domain: impl Into<String>,
    ) -> Self {
        Self {
            procedure_id: procedure_id.into(),
            confidence,
            declared_domain: declared_domain.into(),
        }
    }
}

#[async_trait]
pub trait ProcedureMatcher: Send + Sync {
    /// Candidate procedures for a goal, best first
    async fn match_goal(
        &self,
        goal: &str,
        constraints: &Constraints,
    ) -> anyhow::Result<Vec<ProcedureMatch>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcedureError {
    #[error("procedure '{procedure_id}' not found")]
    NotFound { procedure_id: String },
    #[error("procedure '{procedure_id}' rejected parameters: {detail}")]
    IncompatibleParameters { procedure_id: String, detail: String },
}

#[async_trait]
pub trait ProcedureLibrary: Send + Sync {
    async fn get_graph(
        &self,
        procedure_id: &str,
        parameters: &Constraints,
    ) -> Result<ActionGraph, ProcedureError>;

    /// Historical success rate in [0, 1], if the library tracks one
    fn success_rate(&self, _procedure_id: &str) -> Option<f64> {
        None
    }

    /// Feedback from a finished deterministic run
    fn record_outcome(&self, _procedure_id: &str, _succeeded: bool) {}
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("planning failed: {reason}")]
pub struct PlanningFailed {
    pub reason: String,
}

impl PlanningFailed {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        goal: &str,
        constraints: &Constraints,
        budget: u64,
    ) -> Result<ActionGraph, PlanningFailed>;
}

// ---------------------------------------------------------------------------
// Execution surface
// ---------------------------------------------------------------------------

/// Concrete target produced by the locator resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHandle {
    pub descriptor: TargetDescriptor,
    pub locator: String,
}

impl TargetHandle {
    pub fn new(descriptor: TargetDescriptor, locator: impl Into<String>) -> Self {
        Self {
            descriptor,
            locator: locator.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("target '{descriptor}' is unresolvable: {reason}")]
pub struct Unresolvable {
    pub descriptor: TargetDescriptor,
    pub reason: String,
}

#[async_trait]
pub trait LocatorResolver: Send + Sync {
    async fn resolve(&self, target: &TargetDescriptor) -> Result<TargetHandle, Unresolvable>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("target not ready: {0}")]
    NotReady(String),
    #[error("surface timed out: {0}")]
    Timeout(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl SurfaceError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Transport(_) => ReasonCode::Transport,
            Self::NotReady(_) => ReasonCode::NotReady,
            Self::Timeout(_) => ReasonCode::Timeout,
            Self::Unsupported(_) => ReasonCode::Unsupported,
        }
    }
}

#[async_trait]
pub trait ExecutionSurface: Send + Sync {
    async fn perform(
        &self,
        kind: OperationKind,
        target: Option<&TargetHandle>,
        params: &HashMap<String, Value>,
    ) -> Result<Value, SurfaceError>;
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyVerdict {
    Allow,
    Deny,
    RequireApproval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequirement {
    pub reason: String,
    #[serde(default)]
    pub approver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub verdict: PolicyVerdict,
    #[serde(default)]
    pub matched_rules: Vec<String>,
    #[serde(default)]
    pub approval: Option<ApprovalRequirement>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            verdict: PolicyVerdict::Allow,
            matched_rules: Vec::new(),
            approval: None,
        }
    }

    pub fn deny(rule: impl Into<String>) -> Self {
        Self {
            verdict: PolicyVerdict::Deny,
            matched_rules: vec![rule.into()],
            approval: None,
        }
    }

    pub fn require_approval(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            verdict: PolicyVerdict::RequireApproval,
            matched_rules: vec![rule.into()],
            approval: Some(ApprovalRequirement {
                reason: reason.into(),
                approver: None,
            }),
        }
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.verdict)?;
        if !self.matched_rules.is_empty() {
            write!(f, " (rules: {})", self.matched_rules.join(", "))?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn evaluate(&self, task: &TaskView, graph: &ActionGraph) -> PolicyDecision;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    Unresolved,
}

#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(
        &self,
        task: &TaskView,
        graph: &ActionGraph,
        decision: &PolicyDecision,
    ) -> ApprovalOutcome;
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureReason {
    Failure,
    AssertionFailed,
    Success,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureContext {
    pub run_id: String,
    pub graph_id: String,
    pub node_id: String,
    pub kind: OperationKind,
    pub attempt: u32,
    pub reason: CaptureReason,
    pub detail: Option<String>,
}

#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    async fn capture(&self, context: &CaptureContext) -> anyhow::Result<ArtifactHandle>;
}
