//! Operations and observability.
//!
//! - [`observability`] - Scheduler metrics

pub mod observability;
