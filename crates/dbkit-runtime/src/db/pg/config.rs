use std::time::Duration;

use dbkit_core::config::DriverConfig;
use dbkit_core::error::{DbkitError, Result};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

/// Connection settings for the `pg` driver.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub ssl: PgSslMode,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgConfig {
    pub fn from_driver(driver: &DriverConfig) -> Result<Self> {
        Ok(Self {
            host: driver.string("host")?.to_string(),
            port: driver.parse("port")?,
            name: driver.string("name")?.to_string(),
            user: driver.string("user")?.to_string(),
            password: driver.string("password")?.to_string(),
            ssl: parse_ssl_mode(driver.string("ssl")?)?,
            max_connections: driver.parse_or("max_connections", 5)?,
            acquire_timeout: Duration::from_secs(driver.parse_or("acquire_timeout_secs", 10)?),
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
            .ssl_mode(self.ssl)
    }
}

fn parse_ssl_mode(raw: &str) -> Result<PgSslMode> {
    match raw {
        "disable" => Ok(PgSslMode::Disable),
        "allow" => Ok(PgSslMode::Allow),
        "prefer" => Ok(PgSslMode::Prefer),
        "require" => Ok(PgSslMode::Require),
        "verify-ca" => Ok(PgSslMode::VerifyCa),
        "verify-full" => Ok(PgSslMode::VerifyFull),
        other => Err(DbkitError::Config(format!(
            "pg driver received unknown ssl mode '{}', expected one of \
             disable, allow, prefer, require, verify-ca, verify-full",
            other
        ))),
    }
}
