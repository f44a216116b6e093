//! Runtime configuration for the slowmode service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::slowmode_eligibility::CapabilitySet;

pub const SLOWMODE_RUNTIME_CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_SLOWMODE_DATABASE_PATH: &str = ".tau/slowmode/slowmode.sqlite";

fn default_schema_version() -> u32 {
    SLOWMODE_RUNTIME_CONFIG_SCHEMA_VERSION
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_SLOWMODE_DATABASE_PATH)
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_expiry_timers_enabled() -> bool {
    true
}

fn default_interrupt_retention_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlowmodeRuntimeConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_expiry_timers_enabled")]
    pub expiry_timers_enabled: bool,
    #[serde(default = "default_interrupt_retention_ms")]
    pub interrupt_retention_ms: u64,
    #[serde(default = "CapabilitySet::bot_slowmode_default")]
    pub required_capabilities: CapabilitySet,
}

impl Default for SlowmodeRuntimeConfig {
    fn default() -> Self {
        Self {
            schema_version: SLOWMODE_RUNTIME_CONFIG_SCHEMA_VERSION,
            database_path: default_database_path(),
            sweep_interval_ms: default_sweep_interval_ms(),
            expiry_timers_enabled: default_expiry_timers_enabled(),
            interrupt_retention_ms: default_interrupt_retention_ms(),
            required_capabilities: CapabilitySet::bot_slowmode_default(),
        }
    }
}

impl SlowmodeRuntimeConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn interrupt_retention(&self) -> Duration {
        Duration::from_millis(self.interrupt_retention_ms)
    }
}

/// Missing files yield defaults.
pub fn load_slowmode_runtime_config(path: &Path) -> Result<SlowmodeRuntimeConfig> {
    if !path.exists() {
        return Ok(SlowmodeRuntimeConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read slowmode config {}", path.display()))?;
    let parsed = serde_json::from_str::<SlowmodeRuntimeConfig>(&raw)
        .with_context(|| format!("failed to parse slowmode config {}", path.display()))?;
    validate_slowmode_runtime_config(&parsed)?;
    Ok(parsed)
}

pub fn validate_slowmode_runtime_config(config: &SlowmodeRuntimeConfig) -> Result<()> {
    if config.schema_version != SLOWMODE_RUNTIME_CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported slowmode config schema_version {} (expected {})",
            config.schema_version,
            SLOWMODE_RUNTIME_CONFIG_SCHEMA_VERSION
        );
    }
    if config.database_path.as_os_str().is_empty() {
        bail!("slowmode config database_path must not be empty");
    }
    if config.sweep_interval_ms == 0 {
        bail!("slowmode config sweep_interval_ms must be greater than zero");
    }
    if config.required_capabilities.is_empty() {
        bail!("slowmode config required_capabilities must not be empty");
    }
    Ok(())
}
