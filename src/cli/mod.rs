//! Command-line interface.
//!
//! Unified CLI for Trellis operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Trellis - declarative reconciliation engine for network dataplanes.
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine against the in-memory dataplane until Ctrl-C.
    Start(commands::StartArgs),
    /// Apply a desired-state file once and print the report.
    Apply(commands::ApplyArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}
