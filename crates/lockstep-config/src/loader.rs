//! Configuration loader with multi-source merging

use crate::{LockstepConfig, Paths};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    paths: Paths,
    env_prefix: String,
    include_user_config: bool,
    env_vars: Option<config::Map<String, String>>,
}

impl ConfigLoader {
    /// Loader rooted at the current directory, reading the process environment
    pub fn new() -> Self {
        let project_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            paths: Paths::new(project_dir),
            env_prefix: "LOCKSTEP".to_string(),
            include_user_config: true,
            env_vars: None,
        }
    }

    /// Set the project directory, keeping any user directory override
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let mut paths = Paths::new(dir.as_ref());
        if let Ok(user_dir) = self.paths.user_config_dir() {
            paths = paths.with_user_dir(user_dir);
        }
        self.paths = paths;
        self
    }

    /// Read the user layer from `dir` instead of the platform config dir
    pub fn with_user_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths = self.paths.with_user_dir(dir);
        self.include_user_config = true;
        self
    }

    /// Set the environment variable prefix (default: "LOCKSTEP")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read the environment layer from `vars` instead of the process environment
    pub fn with_env_vars<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    /// Skip the user config file (hermetic test runs)
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Config files that exist on disk, lowest precedence first.
    pub fn config_files(&self) -> Vec<PathBuf> {
        self.paths
            .candidates(self.include_user_config)
            .into_iter()
            .filter(|path| path.exists())
            .collect()
    }

    /// Merges defaults, config files and environment, then validates.
    pub fn load(self) -> Result<LockstepConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&LockstepConfig::default())?);

        for file in self.config_files() {
            builder = builder.add_source(config::File::from(file).format(config::FileFormat::Toml));
        }

        // LOCKSTEP__WAIT__TIMEOUT_MS=...; keys contain single underscores
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(self.env_vars),
        );

        let merged: LockstepConfig = builder
            .build()
            .and_then(config::Config::try_deserialize)
            .context("Failed to merge configuration layers")?;
        merged
            .validate()
            .context("Configuration failed validation")?;
        Ok(merged)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> LockstepConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
