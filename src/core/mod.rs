// Core infrastructure shared by the graph, executor, scheduler and supervisor

pub mod cancel;
pub mod config;
pub mod errors;
pub mod limits;
pub mod telemetry;
pub mod time;

pub use cancel::{CancelHandle, CancelToken};
pub use config::{OrchestratorConfig, OrchestratorConfigBuilder};
pub use errors::{AuraError, ReasonCode, Result};
pub use limits::{BudgetTracker, LimitCheck};
pub use telemetry::init_tracing;
