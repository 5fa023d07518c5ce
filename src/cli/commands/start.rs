//! Start command implementation.

use super::{init_tracing, load_config, memory_registry};
use crate::core::config::ConfigOverrides;
use crate::core::runtime::Runtime;
use crate::plugins::DesiredState;
use anyhow::Result;
use clap::Args;
use std::path::{Path, PathBuf};

/// Run the engine until interrupted.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Desired-state JSON file applied at startup.
    #[arg(long)]
    pub state: Option<PathBuf>,

    /// Override the refresh period in milliseconds (0 disables it).
    #[arg(long)]
    pub refresh_period_ms: Option<u64>,
}

/// Run the start command.
pub async fn run_start(
    args: StartArgs,
    config_path: &Path,
    overrides: &ConfigOverrides,
) -> Result<()> {
    let mut overrides = overrides.clone();
    if args.refresh_period_ms.is_some() {
        overrides.refresh_period_ms = args.refresh_period_ms;
    }
    let config = load_config(config_path, &overrides)?;
    init_tracing(&config.telemetry.log_level);

    let (registry, _dataplane) = memory_registry()?;
    let mut runtime = Runtime::new(config, registry)?;
    runtime.start().await?;

    if let Some(path) = &args.state {
        let state = DesiredState::from_file(path)?;
        tracing::info!(items = state.len(), path = %path.display(), "applying initial state");
        let report = runtime.commit(state.to_resync()).await?;
        print!("{}", report);
    }

    runtime.wait_for_signal().await;
    runtime.stop().await
}
