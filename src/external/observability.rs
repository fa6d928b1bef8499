use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use super::{ArtifactHandle, CaptureContext, ObservabilitySink};

/// Records captures as structured log events and hands back a synthetic handle
#[derive(Debug, Default)]
pub struct TracingObservabilitySink {
    captured: AtomicU64,
}

impl TracingObservabilitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObservabilitySink for TracingObservabilitySink {
    async fn capture(&self, context: &CaptureContext) -> anyhow::Result<ArtifactHandle> {
        let seq = self.captured.fetch_add(1, Ordering::Relaxed);
        info!(
            run_id = %context.run_id,
            graph_id = %context.graph_id,
            node_id = %context.node_id,
            attempt = context.attempt,
            reason = ?context.reason,
            detail = context.detail.as_deref().unwrap_or(""),
            "Diagnostic capture"
        );
        Ok(ArtifactHandle(format!(
            "trace://{}/{}/{}",
            context.run_id, context.node_id, seq
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::CaptureReason;
    use crate::graph::OperationKind;

    #[tokio::test]
    async fn test_capture_returns_unique_handles() {
        let sink = TracingObservabilitySink::new();
        let ctx = CaptureContext {
            run_id: "run".into(),
            graph_id: "g".into(),
            node_id: "n".into(),
            kind: OperationKind::Click,
            attempt: 1,
            reason: CaptureReason::Failure,
            detail: None,
        };
        let a = sink.capture(&ctx).await.unwrap();
        let b = sink.capture(&ctx).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(sink.captured(), 2);
    }
}
