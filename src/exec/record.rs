use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::core::errors::ReasonCode;
use crate::external::ArtifactHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Classified node failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub code: ReasonCode,
    pub detail: String,
}

impl NodeFailure {
    pub fn new(code: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

/// Why a node never ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    /// None of the node's incoming edges activated
    GuardInactive,
    BudgetExhausted,
    DeadlineExceeded,
    Cancelled,
}

impl SkipReason {
    pub fn from_abort(code: ReasonCode) -> Option<Self> {
        match code {
            ReasonCode::BudgetExhausted => Some(Self::BudgetExhausted),
            ReasonCode::DeadlineExceeded => Some(Self::DeadlineExceeded),
            ReasonCode::Cancelled => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Per-run state of one node, published once it reaches a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub status: NodeStatus,
    pub attempts: u32,
    pub last_error: Option<NodeFailure>,
    pub skip_reason: Option<SkipReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub artifact: Option<ArtifactHandle>,
}

impl NodeExecutionRecord {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            attempts: 0,
            last_error: None,
            skip_reason: None,
            started_at: None,
            finished_at: None,
            result: None,
            artifact: None,
        }
    }

    pub fn skipped(node_id: impl Into<String>, reason: SkipReason) -> Self {
        let now = Utc::now();
        Self {
            status: NodeStatus::Skipped,
            skip_reason: Some(reason),
            finished_at: Some(now),
            ..Self::pending(node_id)
        }
    }

    /// Record for a node completed without touching the surface; counts as
    /// one attempt so budget accounting still applies
    pub fn dry_run(node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            status: NodeStatus::Succeeded,
            attempts: 1,
            started_at: Some(now),
            finished_at: Some(now),
            ..Self::pending(node_id)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == NodeStatus::Succeeded
    }

    pub fn failed(&self) -> bool {
        self.status == NodeStatus::Failed
    }

    /// Whether the node actually ran (as opposed to being skipped)
    pub fn executed(&self) -> bool {
        matches!(self.status, NodeStatus::Succeeded | NodeStatus::Failed)
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}
