use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::graph::GraphViolation;

/// Machine-readable failure taxonomy shared by nodes, graphs and tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    MalformedGraph,
    Unresolvable,
    Transport,
    NotReady,
    Timeout,
    Unsupported,
    AssertionFailed,
    PolicyDenied,
    ApprovalRequired,
    BudgetExhausted,
    DeadlineExceeded,
    StructuralMismatch,
    PlanningFailed,
    ProcedureUnavailable,
    Cancelled,
    NodeFailed,
    Internal,
}

impl ReasonCode {
    /// Whether a node may retry after failing with this code
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unresolvable | Self::Transport | Self::NotReady | Self::Timeout
        )
    }

    /// Task-level codes that abort a run in place
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::BudgetExhausted | Self::DeadlineExceeded | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedGraph => "MALFORMED_GRAPH",
            Self::Unresolvable => "UNRESOLVABLE",
            Self::Transport => "TRANSPORT",
            Self::NotReady => "NOT_READY",
            Self::Timeout => "TIMEOUT",
            Self::Unsupported => "UNSUPPORTED",
            Self::AssertionFailed => "ASSERTION_FAILED",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::StructuralMismatch => "STRUCTURAL_MISMATCH",
            Self::PlanningFailed => "PLANNING_FAILED",
            Self::ProcedureUnavailable => "PROCEDURE_UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
            Self::NodeFailed => "NODE_FAILED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-level error for API misuse and fatal conditions.
///
/// Node and graph failures are carried as values inside execution records;
/// this type is only returned when an operation cannot proceed at all.
#[derive(Debug, Error)]
pub enum AuraError {
    #[error("Malformed graph '{graph_id}': {} violation(s)", violations.len())]
    MalformedGraph {
        graph_id: String,
        violations: Vec<GraphViolation>,
    },

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AuraError {
    pub fn malformed_graph<S: Into<String>>(graph_id: S, violations: Vec<GraphViolation>) -> Self {
        Self::MalformedGraph {
            graph_id: graph_id.into(),
            violations,
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn task_not_found<S: Into<String>>(task_id: S) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::MalformedGraph { .. } => "graph",
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::TaskNotFound { .. } => "task",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::MalformedGraph { .. } => ReasonCode::MalformedGraph,
            _ => ReasonCode::Internal,
        }
    }

    /// Violations carried by a `MalformedGraph` error, empty otherwise
    pub fn violations(&self) -> &[GraphViolation] {
        match self {
            Self::MalformedGraph { violations, .. } => violations,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, AuraError>;

impl From<std::io::Error> for AuraError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for AuraError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for AuraError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for AuraError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}
