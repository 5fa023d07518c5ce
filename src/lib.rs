//! Trellis - declarative reconciliation engine for network dataplanes.
//!
//! Callers describe the state they want as key-value pairs. Trellis works out
//! which dataplane operations bring the system there, runs them in dependency
//! order, retries what failed for transient reasons and periodically compares
//! its view of the world against what the dataplane actually reports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Northbound transactions / resync               │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Scheduler                               │
//! │   TxnQueue │ Transaction engine │ RetryQueue │ Refresh │ History │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Dependency graph                           │
//! │        Nodes │ Reverse dependency index │ Topological plan      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Descriptor registry                           │
//! │     interfaces │ addresses │ routes │ IPSec SAs │ ...           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Async runtime driving the scheduler
//! - [`core::time`] - Ticks and clocks
//! - [`core::error`] - Error types and failure classes
//!
//! ## Descriptors
//! - [`descriptor::value`] - Keys, values, metadata and origin
//! - [`descriptor::contract`] - The descriptor capability set
//! - [`descriptor::typed`] - Typed descriptors
//! - [`descriptor::registry`] - Prefix-based registry
//!
//! ## Graph
//! - [`graph::store`] - Nodes and the reverse dependency index
//! - [`graph::plan`] - Topological planning
//!
//! ## Scheduler
//! - [`scheduler::engine`] - Transaction execution
//! - [`scheduler::retry`] - Failure classification and retry backoff
//! - [`scheduler::refresh`] - Dump and drift correction
//!
//! ## Plugins
//! - [`plugins`] - Reference descriptors over an in-memory dataplane
//!
//! ## Operations
//! - [`ops::observability`] - Metrics
//!
//! # Key Invariants
//!
//! - A value is never added before all of its dependencies are applied
//! - A value is never left applied after one of its dependencies is removed
//! - A key appears exactly once in the report of the transaction that submitted it
//! - Transactions execute one at a time, in submission order

// Core infrastructure
pub mod core;

// Descriptor contract and registry
pub mod descriptor;

// Dependency graph and planning
pub mod graph;

// Transaction engine
pub mod scheduler;

// Reference descriptors
pub mod plugins;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use descriptor::{Descriptor, DescriptorRegistry, KvDescriptor, Origin, Value};
pub use ops::observability;
pub use scheduler::{Change, KeyStatus, Scheduler, Transaction, TxnReport, TxnState};
