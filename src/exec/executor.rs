use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use super::assertion::{self, Probe};
use super::handler::HandlerTable;
use super::record::{NodeExecutionRecord, NodeFailure, NodeStatus};
use super::retry::BackoffPolicy;
use crate::core::cancel::CancelToken;
use crate::core::config::OrchestratorConfig;
use crate::core::errors::ReasonCode;
use crate::external::{
    ArtifactHandle, CaptureContext, CaptureReason, ExecutionSurface, LocatorResolver,
    ObservabilitySink,
};
use crate::graph::ActionNode;

/// Run identity and cancellation visible to a single node execution
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub graph_id: String,
    pub cancel: CancelToken,
}

impl NodeContext {
    pub fn new(run_id: impl Into<String>, graph_id: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            run_id: run_id.into(),
            graph_id: graph_id.into(),
            cancel,
        }
    }
}

/// Runs one node against the execution surface with timeout, retry and
/// assertion semantics.
#[derive(Clone)]
pub struct NodeExecutor {
    handlers: HandlerTable,
    resolver: Arc<dyn LocatorResolver>,
    surface: Arc<dyn ExecutionSurface>,
    observability: Option<Arc<dyn ObservabilitySink>>,
    backoff: BackoffPolicy,
    capture_on_success: bool,
    capture_timeout: Duration,
}

impl NodeExecutor {
    pub fn new(resolver: Arc<dyn LocatorResolver>, surface: Arc<dyn ExecutionSurface>) -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            handlers: HandlerTable::with_defaults(),
            resolver,
            surface,
            observability: None,
            backoff: defaults.retry.clone(),
            capture_on_success: defaults.capture_on_success,
            capture_timeout: defaults.capture_timeout(),
        }
    }

    /// Take backoff and capture settings from the orchestrator configuration
    pub fn configured(mut self, config: &OrchestratorConfig) -> Self {
        self.backoff = config.retry.clone();
        self.capture_on_success = config.capture_on_success;
        self.capture_timeout = config.capture_timeout();
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_observability(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.observability = Some(sink);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn capture_on_success(mut self, enabled: bool) -> Self {
        self.capture_on_success = enabled;
        self
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Execute `node` to a terminal status.
    ///
    /// The returned record is the only place the outcome is published.
    /// Cancellation is observed between attempts, never during one.
    pub async fn execute(&self, node: &ActionNode, ctx: &NodeContext) -> NodeExecutionRecord {
        let mut record = NodeExecutionRecord::pending(&node.id);
        record.started_at = Some(Utc::now());
        let max_attempts = node.max_retries.saturating_add(1);

        let outcome: Result<Value, NodeFailure> = loop {
            record.attempts += 1;
            let attempt = record.attempts;
            debug!(run_id = %ctx.run_id, node_id = %node.id, attempt, "Node attempt");

            let failure = match timeout(node.timeout, self.attempt(node)).await {
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(failure)) => failure,
                Err(_) => NodeFailure::new(
                    ReasonCode::Timeout,
                    format!("attempt {} exceeded {}ms", attempt, node.timeout.as_millis()),
                ),
            };

            if !failure.is_retryable() || attempt >= max_attempts {
                break Err(failure);
            }

            let delay = self.backoff.delay_for(attempt);
            warn!(
                run_id = %ctx.run_id,
                node_id = %node.id,
                attempt,
                "Attempt failed ({}), retrying in {:?}",
                failure,
                delay
            );
            if ctx.cancel.is_cancelled() {
                break Err(cancelled_after(attempt, &failure));
            }
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break Err(cancelled_after(attempt, &failure)),
                _ = sleep(delay) => {}
            }
        };

        let capture_reason = match &outcome {
            Ok(_) if self.capture_on_success => Some(CaptureReason::Success),
            Ok(_) => None,
            Err(f) if f.code == ReasonCode::AssertionFailed => Some(CaptureReason::AssertionFailed),
            Err(f) if f.code == ReasonCode::Cancelled => None,
            Err(_) => Some(CaptureReason::Failure),
        };
        if let Some(reason) = capture_reason {
            let detail = outcome.as_ref().err().map(|f| f.to_string());
            record.artifact = self.capture(node, ctx, record.attempts, reason, detail).await;
        }

        match outcome {
            Ok(value) => {
                record.status = NodeStatus::Succeeded;
                record.result = Some(value);
            }
            Err(failure) => {
                error!(
                    run_id = %ctx.run_id,
                    node_id = %node.id,
                    attempts = record.attempts,
                    code = %failure.code,
                    "Node failed: {}",
                    failure.detail
                );
                record.status = NodeStatus::Failed;
                record.last_error = Some(failure);
            }
        }
        record.finished_at = Some(Utc::now());
        record
    }

    /// One attempt: resolve, perform, then check every assertion
    async fn attempt(&self, node: &ActionNode) -> Result<Value, NodeFailure> {
        let target = match &node.target {
            Some(descriptor) => Some(
                self.resolver
                    .resolve(descriptor)
                    .await
                    .map_err(|e| NodeFailure::new(ReasonCode::Unresolvable, e.to_string()))?,
            ),
            None => None,
        };

        let handler = self.handlers.get(node.kind).ok_or_else(|| {
            NodeFailure::new(
                ReasonCode::Unsupported,
                format!("no handler registered for {}", node.kind),
            )
        })?;

        let value = handler
            .perform(self.surface.as_ref(), node, target.as_ref())
            .await
            .map_err(|e| NodeFailure::new(e.reason_code(), e.to_string()))?;

        let probe = Probe {
            resolver: self.resolver.as_ref(),
            surface: self.surface.as_ref(),
        };
        for check in &node.assertions {
            assertion::evaluate(check, &value, &probe).await?;
        }
        Ok(value)
    }

    async fn capture(
        &self,
        node: &ActionNode,
        ctx: &NodeContext,
        attempt: u32,
        reason: CaptureReason,
        detail: Option<String>,
    ) -> Option<ArtifactHandle> {
        let sink = self.observability.as_ref()?;
        let context = CaptureContext {
            run_id: ctx.run_id.clone(),
            graph_id: ctx.graph_id.clone(),
            node_id: node.id.clone(),
            kind: node.kind,
            attempt,
            reason,
            detail,
        };
        match timeout(self.capture_timeout, sink.capture(&context)).await {
            Ok(Ok(handle)) => Some(handle),
            Ok(Err(e)) => {
                warn!(node_id = %node.id, "Diagnostic capture failed: {:#}", e);
                None
            }
            Err(_) => {
                warn!(
                    node_id = %node.id,
                    "Diagnostic capture exceeded {:?}", self.capture_timeout
                );
                None
            }
        }
    }
}

fn cancelled_after(attempt: u32, last: &NodeFailure) -> NodeFailure {
    NodeFailure::new(
        ReasonCode::Cancelled,
        format!("cancelled after attempt {} ({})", attempt, last),
    )
}
