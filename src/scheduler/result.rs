use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::errors::ReasonCode;
use crate::exec::{NodeExecutionRecord, NodeStatus};
use crate::external::ArtifactHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphStatus {
    Succeeded,
    Failed,
}

/// Why a graph run failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphFailure {
    pub code: ReasonCode,
    pub detail: String,
    /// Node the failure is attributed to, if any
    pub node_id: Option<String>,
}

impl fmt::Display for GraphFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "{} at '{}': {}", self.code, node, self.detail),
            None => write!(f, "{}: {}", self.code, self.detail),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub layers: usize,
    pub dispatched_layers: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retries: u32,
    pub budget: u64,
    pub budget_consumed: u64,
    pub elapsed_ms: u64,
    pub artifacts: Vec<ArtifactHandle>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphExecutionResult {
    pub graph_id: String,
    pub run_id: String,
    pub status: GraphStatus,
    /// One record per node, in declaration order
    pub records: Vec<NodeExecutionRecord>,
    pub failure: Option<GraphFailure>,
    pub diagnostics: RunDiagnostics,
}

impl GraphExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == GraphStatus::Succeeded
    }

    pub fn record(&self, node_id: &str) -> Option<&NodeExecutionRecord> {
        self.records.iter().find(|r| r.node_id == node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.record(node_id).map(|r| r.status)
    }

    pub fn failure_code(&self) -> Option<ReasonCode> {
        self.failure.as_ref().map(|f| f.code)
    }

    pub fn was_cancelled(&self) -> bool {
        self.failure_code() == Some(ReasonCode::Cancelled)
    }
}
