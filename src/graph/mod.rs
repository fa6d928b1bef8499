//! Action graph model
//!
//! Immutable graph descriptions plus the two structural operations the
//! scheduler relies on: `validate` and `topological_layers`.

pub mod builder;
pub mod model;
pub mod validate;

pub use builder::ActionGraphBuilder;
pub use model::{
    ActionEdge, ActionGraph, ActionNode, Assertion, EdgeGuard, OperationKind, TargetDescriptor,
};
pub use validate::{topological_layers, validate, GraphViolation};
