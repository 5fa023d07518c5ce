//! Config command implementation.

use super::load_config;
use crate::core::config::{Config, ConfigOverrides};
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration file.
    Validate,
    /// Print the effective configuration with defaults filled in.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs, config_path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(config_path),
        ConfigCommand::Show { format } => show_config(config_path, overrides, &format),
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    let config = Config::from_file(path)?;
    println!("✓ Config file is valid");

    if config.descriptors.is_empty() {
        println!("  ⚠ Warning: no [descriptors.<name>] policies; defaults apply to every descriptor");
    }
    if config.scheduler.refresh_period_ms == 0 {
        println!("  ⚠ Warning: scheduler.refresh_period_ms is 0, drift is only detected on demand");
    }
    Ok(())
}

fn show_config(path: &Path, overrides: &ConfigOverrides, format: &str) -> Result<()> {
    let config = load_config(path, overrides)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => print!("{}", config.to_toml()?),
        other => anyhow::bail!("unknown format {:?} (expected toml or json)", other),
    }
    Ok(())
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = generate_template();
    match output {
        Some(path) => {
            std::fs::write(path, &template)?;
            println!("Generated config template: {:?}", path);
        }
        None => println!("{}", template),
    }
    Ok(())
}

fn generate_template() -> String {
    r#"# Trellis Configuration

[scheduler]
# Total attempts, including the first, before a retriable failure is given up.
max_retry_attempts = 3
retry_backoff_ms = 1000
exponential_backoff = true
max_retry_backoff_ms = 60000
# 0 disables periodic refresh.
refresh_period_ms = 30000
retry_tick_ms = 100
max_derivation_depth = 4
history_size = 64

[telemetry]
log_level = "info"

[descriptors.vpp-interface]
preserve_external = true
op_timeout_ms = 2000

[descriptors.vpp-route]
preserve_external = false
"#
    .to_string()
}
