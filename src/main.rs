//! Trellis - unified CLI entrypoint.
//!
//! Usage:
//!   trellis start --config config/trellis.toml [--state demos/state.json]
//!   trellis apply --state demos/state.json [--format json] [--refresh]
//!   trellis config validate --config config/trellis.toml

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use trellis::cli::commands::{run_apply, run_config, run_start};
use trellis::cli::{Cli, Commands};
use trellis::core::config::ConfigOverrides;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/trellis.toml"));
    let overrides = ConfigOverrides {
        log_level: cli.log_level,
        ..Default::default()
    };

    match cli.command {
        Commands::Start(args) => run_start(args, &config_path, &overrides).await,
        Commands::Apply(args) => run_apply(args, &config_path, &overrides).await,
        Commands::Config(args) => run_config(args, &config_path, &overrides),
    }
}
