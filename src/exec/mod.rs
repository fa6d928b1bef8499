//! Node executor
//!
//! Runs a single action node: resolves its target, dispatches the operation
//! through the handler table, evaluates assertions, and retries retryable
//! failures with capped exponential backoff.

pub(crate) mod assertion;
pub mod executor;
pub mod handler;
pub mod record;
pub mod retry;

pub use executor::{NodeContext, NodeExecutor};
pub use handler::{HandlerTable, OperationHandler, SurfaceHandler, WaitHandler};
pub use record::{NodeExecutionRecord, NodeFailure, NodeStatus, SkipReason};
pub use retry::BackoffPolicy;
