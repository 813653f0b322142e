//! Configuration management for lockstep
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (LOCKSTEP__* prefix, highest precedence)
//! 2. lockstep.local.toml (gitignored, local overrides)
//! 3. lockstep.toml (git-tracked, project config)
//! 4. ~/.config/lockstep/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{LOCAL_CONFIG_FILE, PROJECT_CONFIG_FILE, Paths, USER_CONFIG_FILE};

/// Main lockstep configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockstepConfig {
    pub wait: WaitConfig,
    pub retry: RetryConfig,
    pub diagnostics: DiagnosticsConfig,
    pub entropy: EntropyConfig,
    /// Extra delay scenarios, keyed by name. Entries override built-in presets.
    pub scenarios: BTreeMap<String, ScenarioDefinition>,
}

/// Defaults for condition waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub adaptive: bool,
    pub growth_factor: f64,
    /// Attempts before adaptive growth kicks in.
    pub warmup_attempts: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            poll_interval_ms: 100,
            min_interval_ms: 10,
            max_interval_ms: 1_000,
            adaptive: true,
            growth_factor: 1.5,
            warmup_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 100,
            backoff_ceiling_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Ring buffer capacity; oldest entries are evicted past this.
    pub capacity: usize,
    /// Trailing entries included in failure messages; unset means the whole log.
    pub dump_tail: Option<usize>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            dump_tail: None,
        }
    }
}

/// Source of the pseudo-random samples behind jitter and failure injection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// `elapsed_ms mod 100`, the legacy time-derived model.
    VirtualTime,
    /// Seeded PRNG keyed by `EntropyConfig::seed`.
    Seeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    pub mode: FailureMode,
    pub seed: u64,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            mode: FailureMode::Seeded,
            seed: 0,
        }
    }
}

/// Delay scenario declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub base_delay_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    3
}

impl LockstepConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file without layering.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Create a reproducible configuration keyed by `seed`
    pub fn deterministic(seed: u64) -> Self {
        Self {
            entropy: EntropyConfig {
                mode: FailureMode::Seeded,
                seed,
            },
            ..Default::default()
        }
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let wait = &self.wait;
        if wait.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "wait.timeout_ms must be positive".to_string(),
            ));
        }
        if wait.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "wait.poll_interval_ms must be positive".to_string(),
            ));
        }
        if wait.max_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "wait.max_interval_ms must be positive".to_string(),
            ));
        }
        if wait.min_interval_ms > wait.max_interval_ms {
            return Err(ConfigError::ValidationError(format!(
                "wait.min_interval_ms ({}) exceeds wait.max_interval_ms ({})",
                wait.min_interval_ms, wait.max_interval_ms
            )));
        }
        if !(wait.growth_factor >= 1.0 && wait.growth_factor.is_finite()) {
            return Err(ConfigError::ValidationError(format!(
                "wait.growth_factor must be >= 1.0, got {}",
                wait.growth_factor
            )));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_ceiling_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry.backoff_base_ms ({}) exceeds retry.backoff_ceiling_ms ({})",
                self.retry.backoff_base_ms, self.retry.backoff_ceiling_ms
            )));
        }
        if self.diagnostics.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "diagnostics.capacity must be at least 1".to_string(),
            ));
        }
        for (name, scenario) in &self.scenarios {
            if !(0.0..=1.0).contains(&scenario.failure_rate) {
                return Err(ConfigError::ValidationError(format!(
                    "scenarios.{name}.failure_rate must be within [0, 1], got {}",
                    scenario.failure_rate
                )));
            }
            if scenario.retry_multiplier < 1.0 {
                return Err(ConfigError::ValidationError(format!(
                    "scenarios.{name}.retry_multiplier must be >= 1.0, got {}",
                    scenario.retry_multiplier
                )));
            }
        }
        Ok(())
    }
}
