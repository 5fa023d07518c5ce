//! In-memory dependency graph.
//!
//! - [`node`] - Graph nodes and the node state machine
//! - [`store`] - Node storage with the reverse dependency index
//! - [`plan`] - Topological planning of a change set

pub mod node;
pub mod plan;
pub mod store;

pub use node::{Node, NodeState};
pub use plan::{topological_plan, OpKind, OpReason, Plan, PlannedOp};
pub use store::Graph;
