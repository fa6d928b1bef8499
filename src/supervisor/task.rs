use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::core::errors::ReasonCode;
use crate::exec::NodeExecutionRecord;
use crate::external::Constraints;
use crate::router::{ExecutionMode, RequestedMode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// PENDING -> RUNNING -> {COMPLETED, FAILED, CANCELLED}; terminal states are final
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Internal progress of a running task. Externally every phase is RUNNING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Routing,
    Planning,
    Gating,
    Executing,
    Degrading,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: ReasonCode,
    pub detail: String,
}

impl TaskFailure {
    pub fn new(code: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub at: DateTime<Utc>,
    pub event: String,
    pub detail: String,
}

impl TaskEvent {
    pub fn new(event: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            event: event.into(),
            detail: detail.into(),
        }
    }
}

fn default_budget() -> u64 {
    1_000
}

/// What a caller submits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub goal: String,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default = "default_budget")]
    pub budget: u64,
    #[serde(default)]
    pub requested_mode: Option<RequestedMode>,
    /// Task deadline in milliseconds; the configured default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            constraints: Constraints::new(),
            risk: RiskLevel::Low,
            budget: default_budget(),
            requested_mode: None,
            timeout_ms: None,
        }
    }

    pub fn constraint(mut self, key: impl Into<String>, value: Value) -> Self {
        self.constraints.insert(key.into(), value);
        self
    }

    pub fn risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }

    pub fn mode(mut self, mode: RequestedMode) -> Self {
        self.requested_mode = Some(mode);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Read-only snapshot of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub goal: String,
    pub constraints: Constraints,
    pub risk: RiskLevel,
    pub budget: u64,
    pub requested_mode: Option<RequestedMode>,
    pub timeout_ms: Option<u64>,
    pub status: TaskStatus,
    /// The one-shot fallback to dynamic planning was used
    pub degraded: bool,
    pub mode: Option<ExecutionMode>,
    pub graph_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub failure: Option<TaskFailure>,
    /// Node records of the most recent graph run
    pub records: Vec<NodeExecutionRecord>,
    pub budget_consumed: u64,
    pub events: Vec<TaskEvent>,
    pub replay_of: Option<String>,
}

impl TaskView {
    /// A fresh PENDING task for `request` with a new id
    pub fn pending(request: TaskRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: request.goal,
            constraints: request.constraints,
            risk: request.risk,
            budget: request.budget,
            requested_mode: request.requested_mode,
            timeout_ms: request.timeout_ms,
            status: TaskStatus::Pending,
            degraded: false,
            mode: None,
            graph_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            failure: None,
            records: Vec::new(),
            budget_consumed: 0,
            events: Vec::new(),
            replay_of: None,
        }
    }

    /// The request this task was created from
    pub fn request(&self) -> TaskRequest {
        TaskRequest {
            goal: self.goal.clone(),
            constraints: self.constraints.clone(),
            risk: self.risk,
            budget: self.budget,
            requested_mode: self.requested_mode,
            timeout_ms: self.timeout_ms,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn remaining_budget(&self) -> u64 {
        self.budget.saturating_sub(self.budget_consumed)
    }

    pub fn execution_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
