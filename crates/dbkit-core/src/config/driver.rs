use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DbkitError, Result};

/// A named driver and its free-form string settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver name, resolved through a registry.
    #[serde(default)]
    pub driver: String,

    /// Driver specific settings.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl DriverConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            config: HashMap::new(),
        }
    }

    /// Builder-style setter, mostly for tests.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// A required string setting.
    pub fn string(&self, key: &str) -> Result<&str> {
        self.config.get(key).map(String::as_str).ok_or_else(|| {
            DbkitError::Config(format!(
                "{} driver requires '{}' string in config",
                self.driver, key
            ))
        })
    }

    /// A required setting parsed into `T`.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.string(key)?;
        raw.parse().map_err(|_| {
            DbkitError::Config(format!(
                "{} driver expects '{}' to be a {}, received: {}",
                self.driver,
                key,
                std::any::type_name::<T>(),
                raw
            ))
        })
    }

    /// An optional setting parsed into `T`, falling back to `default`.
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        if self.config.contains_key(key) {
            self.parse(key)
        } else {
            Ok(default)
        }
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.driver.is_empty() {
            return Err("driver is required".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_setting() {
        let cfg = DriverConfig::new("fs").with("dir", "migrations/up");
        assert_eq!(cfg.string("dir").unwrap(), "migrations/up");

        let err = cfg.string("missing").unwrap_err();
        assert!(err.to_string().contains("fs driver requires 'missing'"));
    }

    #[test]
    fn test_parse_setting() {
        let cfg = DriverConfig::new("pg").with("port", "5432").with("bad", "abc");
        assert_eq!(cfg.parse::<u16>("port").unwrap(), 5432);
        assert!(cfg.parse::<u16>("bad").is_err());
        assert_eq!(cfg.parse_or::<u32>("max_connections", 5).unwrap(), 5);
    }

    #[test]
    fn test_validate_requires_driver() {
        assert!(DriverConfig::default().validate().is_err());
        assert!(DriverConfig::new("pg").validate().is_ok());
    }
}
