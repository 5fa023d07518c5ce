//! Core runtime infrastructure.
//!
//! This module contains the essential components for running Trellis:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Async runtime driving the scheduler
//! - [`time`] - Tick and clock utilities
//! - [`error`] - Descriptor and scheduler error types

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
