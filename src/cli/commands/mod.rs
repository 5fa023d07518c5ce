//! CLI command implementations.

mod apply;
mod config;
mod start;

pub use apply::{run_apply, ApplyArgs};
pub use config::{run_config, ConfigArgs};
pub use start::{run_start, StartArgs};

use crate::core::config::{Config, ConfigOverrides};
use crate::descriptor::DescriptorRegistry;
use crate::plugins::{self, MemoryDataplane};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Load the config file (defaults if it does not exist) and apply overrides.
pub(crate) fn load_config(path: &Path, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = Config::from_file_or_default(path)
        .with_context(|| format!("failed to load config from {:?}", path))?;
    config.apply_overrides(overrides);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Registry with every reference descriptor over a fresh in-memory dataplane.
pub(crate) fn memory_registry() -> Result<(DescriptorRegistry, Arc<MemoryDataplane>)> {
    let dataplane = Arc::new(MemoryDataplane::new());
    let mut registry = DescriptorRegistry::new();
    plugins::register_all(&mut registry, &dataplane).context("failed to register descriptors")?;
    Ok((registry, dataplane))
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
pub(crate) fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
pub(crate) fn init_tracing(_level: &str) {}
