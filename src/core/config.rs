//! Configuration parsing and validation.
//!
//! Trellis configuration is loaded from TOML files with CLI overrides.
//! The `[scheduler]` section drives retry and refresh behavior, and
//! `[descriptors.<name>]` sections attach per-descriptor policies.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Per-descriptor policies keyed by descriptor name.
    #[serde(default)]
    pub descriptors: BTreeMap<String, DescriptorPolicy>,
}

/// The `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Total attempts (including the first) before a retriable failure becomes terminal.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Double the delay after every failed attempt.
    #[serde(default)]
    pub exponential_backoff: bool,

    /// Upper bound for the retry delay, in milliseconds.
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    /// Period of automatic drift refresh in milliseconds; 0 disables it.
    #[serde(default)]
    pub refresh_period_ms: u64,

    /// How often the runtime checks the retry queue, in milliseconds.
    #[serde(default = "default_retry_tick_ms")]
    pub retry_tick_ms: u64,

    /// Maximum nesting of derived values.
    #[serde(default = "default_max_derivation_depth")]
    pub max_derivation_depth: usize,

    /// Number of executed transactions kept in history.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            exponential_backoff: false,
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            refresh_period_ms: 0,
            retry_tick_ms: default_retry_tick_ms(),
            max_derivation_depth: default_max_derivation_depth(),
            history_size: default_history_size(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Policy attached to a single descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorPolicy {
    /// Keep items found in the dataplane that were never requested northbound.
    #[serde(default)]
    pub preserve_external: bool,

    /// Operations taking longer than this are reported as timeouts when they fail.
    #[serde(default)]
    pub op_timeout_ms: Option<u64>,
}

// Default value functions

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_max_retry_backoff_ms() -> u64 {
    60_000
}

fn default_retry_tick_ms() -> u64 {
    100
}

fn default_max_derivation_depth() -> usize {
    4
}

fn default_history_size() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Serialize the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(refresh_period_ms) = overrides.refresh_period_ms {
            self.scheduler.refresh_period_ms = refresh_period_ms;
        }
        if let Some(max_retry_attempts) = overrides.max_retry_attempts {
            self.scheduler.max_retry_attempts = max_retry_attempts;
        }
    }

    /// Policy for a descriptor, or the default policy if none is configured.
    pub fn descriptor_policy(&self, name: &str) -> DescriptorPolicy {
        self.descriptors.get(name).cloned().unwrap_or_default()
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_scheduler()?;
        self.validate_telemetry()?;
        self.validate_descriptors()?;
        Ok(())
    }

    fn validate_scheduler(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.max_retry_attempts == 0 {
            anyhow::bail!("scheduler.max_retry_attempts must be > 0");
        }
        if s.retry_backoff_ms == 0 {
            anyhow::bail!("scheduler.retry_backoff_ms must be > 0");
        }
        if s.max_retry_backoff_ms < s.retry_backoff_ms {
            anyhow::bail!(
                "scheduler.max_retry_backoff_ms ({}) cannot be lower than retry_backoff_ms ({})",
                s.max_retry_backoff_ms,
                s.retry_backoff_ms
            );
        }
        if s.retry_tick_ms == 0 {
            anyhow::bail!("scheduler.retry_tick_ms must be > 0");
        }
        if s.max_derivation_depth == 0 || s.max_derivation_depth > 32 {
            anyhow::bail!(
                "scheduler.max_derivation_depth must be within 1..=32, got: {}",
                s.max_derivation_depth
            );
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    fn validate_descriptors(&self) -> Result<()> {
        for (name, policy) in &self.descriptors {
            if policy.op_timeout_ms == Some(0) {
                anyhow::bail!("descriptors.{}.op_timeout_ms must be > 0", name);
            }
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override refresh period.
    pub refresh_period_ms: Option<u64>,
    /// Override retry ceiling.
    pub max_retry_attempts: Option<u32>,
}

/// Engine-facing configuration derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_retry_attempts: u32,
    pub retry_backoff: Duration,
    pub exponential_backoff: bool,
    pub max_retry_backoff: Duration,
    pub refresh_period: Option<Duration>,
    pub retry_tick: Duration,
    pub max_derivation_depth: usize,
    pub history_size: usize,
    pub descriptors: BTreeMap<String, DescriptorPolicy>,
}

impl SchedulerConfig {
    /// Policy for a descriptor, or the default policy if none is configured.
    pub fn policy(&self, descriptor: &str) -> DescriptorPolicy {
        self.descriptors
            .get(descriptor)
            .cloned()
            .unwrap_or_default()
    }

    /// Set the policy for a descriptor.
    pub fn with_policy(mut self, descriptor: impl Into<String>, policy: DescriptorPolicy) -> Self {
        self.descriptors.insert(descriptor.into(), policy);
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        let s = &config.scheduler;
        Self {
            max_retry_attempts: s.max_retry_attempts,
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
            exponential_backoff: s.exponential_backoff,
            max_retry_backoff: Duration::from_millis(s.max_retry_backoff_ms),
            refresh_period: (s.refresh_period_ms > 0)
                .then(|| Duration::from_millis(s.refresh_period_ms)),
            retry_tick: Duration::from_millis(s.retry_tick_ms),
            max_derivation_depth: s.max_derivation_depth,
            history_size: s.history_size,
            descriptors: config.descriptors.clone(),
        }
    }
}
