//! Task supervisor
//!
//! Owns task state and drives every task through
//! PENDING -> RUNNING -> {COMPLETED, FAILED, CANCELLED}.

pub mod store;
#[allow(clippy::module_inception)]
pub mod supervisor;
pub mod task;

pub use store::TaskStore;
pub use supervisor::{CancelAck, SupervisorStats, TaskSupervisor, TaskSupervisorBuilder};
pub use task::{
    RiskLevel, TaskEvent, TaskFailure, TaskPhase, TaskRequest, TaskStatus, TaskView,
};
