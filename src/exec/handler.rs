//! Capability table: operation kind -> handler
//!
//! Adding an operation kind means registering a handler here, nothing else
//! in the executor changes.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::external::{ExecutionSurface, SurfaceError, TargetHandle};
use crate::graph::{ActionNode, OperationKind};

#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn perform(
        &self,
        surface: &dyn ExecutionSurface,
        node: &ActionNode,
        target: Option<&TargetHandle>,
    ) -> Result<Value, SurfaceError>;
}

/// Forwards the node's operation to the execution surface unchanged
pub struct SurfaceHandler;

#[async_trait]
impl OperationHandler for SurfaceHandler {
    fn name(&self) -> &str {
        "surface"
    }

    async fn perform(
        &self,
        surface: &dyn ExecutionSurface,
        node: &ActionNode,
        target: Option<&TargetHandle>,
    ) -> Result<Value, SurfaceError> {
        surface.perform(node.kind, target, &node.params).await
    }
}

/// Waits on a target through the surface, or for `duration_ms` when untargeted
pub struct WaitHandler;

#[async_trait]
impl OperationHandler for WaitHandler {
    fn name(&self) -> &str {
        "wait"
    }

    async fn perform(
        &self,
        surface: &dyn ExecutionSurface,
        node: &ActionNode,
        target: Option<&TargetHandle>,
    ) -> Result<Value, SurfaceError> {
        match target {
            Some(handle) => surface.perform(node.kind, Some(handle), &node.params).await,
            None => {
                let millis = node
                    .params
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(Value::Null)
            }
        }
    }
}

#[derive(Clone)]
pub struct HandlerTable {
    handlers: Arc<RwLock<HashMap<OperationKind, Arc<dyn OperationHandler>>>>,
}

impl HandlerTable {
    pub fn empty() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Every kind routed to the surface, with untargeted waits handled locally
    pub fn with_defaults() -> Self {
        let table = Self::empty();
        let surface: Arc<dyn OperationHandler> = Arc::new(SurfaceHandler);
        for kind in OperationKind::ALL {
            table.register(kind, surface.clone());
        }
        table.register(OperationKind::WaitFor, Arc::new(WaitHandler));
        table
    }

    pub fn register(&self, kind: OperationKind, handler: Arc<dyn OperationHandler>) {
        self.handlers.write().insert(kind, handler);
    }

    pub fn get(&self, kind: OperationKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.read().get(&kind).cloned()
    }

    pub fn contains(&self, kind: OperationKind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<_> = self.handlers.read().keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}
