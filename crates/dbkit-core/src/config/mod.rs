mod driver;
pub mod env;

pub use driver::DriverConfig;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DbkitError, Result};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "dbkit.toml";

/// Root configuration for dbkit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbkitConfig {
    /// Which databases and sources the commands operate on.
    #[serde(default)]
    pub active: ActiveConfig,

    /// Environment name to dotenv file path.
    #[serde(default)]
    pub environments: HashMap<String, String>,

    /// Named database driver definitions.
    #[serde(default)]
    pub databases: HashMap<String, DriverConfig>,

    /// Named source driver definitions.
    #[serde(default)]
    pub sources: HashMap<String, DriverConfig>,

    /// Invocation limits.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Settings derived at load time rather than read from the file.
    #[serde(skip)]
    pub global: GlobalConfig,
}

/// The active selection of database, sources and environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveConfig {
    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub environment: Option<String>,

    #[serde(default)]
    pub source: ActiveSourceConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveSourceConfig {
    #[serde(default)]
    pub migrations: MigrationSourcesConfig,

    #[serde(default)]
    pub seeds: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationSourcesConfig {
    #[serde(default)]
    pub up: String,

    #[serde(default)]
    pub down: String,
}

/// Settings shared by every driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfig {
    /// Directory relative paths in driver configs resolve against.
    pub base_dir: PathBuf,
}

impl GlobalConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

/// Deadlines applied to a single invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Deadline for the whole invocation in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Deadline for compensating rollbacks in seconds.
    #[serde(default = "default_timeout")]
    pub rollback_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            rollback_timeout_secs: default_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_secs)
    }
}

fn default_timeout() -> u64 {
    30
}

impl DbkitConfig {
    /// Load, validate and expand configuration from a TOML file.
    ///
    /// `global.base_dir` becomes the directory holding the file, and the
    /// active environment's dotenv file is loaded before `${VAR}` expansion.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DbkitError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::parse_toml(&content)?;
        let absolute = std::fs::canonicalize(path)?;
        config.global.base_dir = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        config.validate()?;
        config.load_environment()?;
        config.expand_env()?;

        debug!(base_dir = %config.global.base_dir.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string without validating it.
    pub fn parse_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DbkitError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Check that every active selection names a usable definition.
    pub fn validate(&self) -> Result<()> {
        if let Some(environment) = self.active_environment() {
            if !self.environments.contains_key(environment) {
                return Err(DbkitError::Config(format!(
                    "{} is not a valid environment",
                    environment
                )));
            }
        }

        validate_driver("active.database", &self.databases, &self.active.database)?;
        validate_driver(
            "active.source.migrations.up",
            &self.sources,
            &self.active.source.migrations.up,
        )?;
        validate_driver(
            "active.source.migrations.down",
            &self.sources,
            &self.active.source.migrations.down,
        )?;
        validate_driver("active.source.seeds", &self.sources, &self.active.source.seeds)?;

        if self.runtime.timeout_secs == 0 || self.runtime.rollback_timeout_secs == 0 {
            return Err(DbkitError::Config(
                "runtime timeouts must be positive".to_string(),
            ));
        }

        Ok(())
    }

    fn active_environment(&self) -> Option<&str> {
        self.active
            .environment
            .as_deref()
            .filter(|environment| !environment.is_empty())
    }

    fn load_environment(&self) -> Result<()> {
        let Some(environment) = self.active_environment() else {
            return Ok(());
        };
        let Some(file) = self.environments.get(environment) else {
            return Ok(());
        };
        let path = self.global.base_dir.join(file);
        dotenvy::from_path(&path).map_err(|e| {
            DbkitError::Config(format!(
                "Failed to load environment file {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!(environment, path = %path.display(), "Environment file loaded");
        Ok(())
    }

    /// Expand `${VAR}` references in active names and driver definitions.
    pub fn expand_env(&mut self) -> Result<()> {
        env::expand_in_place(&mut self.active.database)?;
        env::expand_in_place(&mut self.active.source.migrations.up)?;
        env::expand_in_place(&mut self.active.source.migrations.down)?;
        env::expand_in_place(&mut self.active.source.seeds)?;
        env::expand_driver_map(&mut self.sources)?;
        env::expand_driver_map(&mut self.databases)?;
        Ok(())
    }
}

fn validate_driver(
    port: &str,
    definitions: &HashMap<String, DriverConfig>,
    name: &str,
) -> Result<()> {
    if name.is_empty() {
        return Err(DbkitError::Config(format!("{} driver is missing", port)));
    }
    let definition = definitions.get(name).ok_or_else(|| {
        DbkitError::Config(format!("{} is not a valid {} config", name, port))
    })?;
    definition.validate().map_err(|e| {
        DbkitError::Config(format!("{} is not a valid {} config: {}", name, port, e))
    })
}
