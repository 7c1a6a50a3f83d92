//! PostgreSQL driver.
//!
//! The migration lock maps onto a session level advisory lock, so a
//! connection keeps its pooled session for its whole lifetime and every
//! statement, transaction and history update goes through that session.

mod config;
mod connection;
mod history;
mod lock;
mod transaction;

pub use config::PgConfig;
pub use connection::PostgresConnection;
pub use history::PostgresHistory;
pub use lock::PostgresLock;
pub use transaction::PostgresTransaction;

use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::config::{DriverConfig, GlobalConfig};
use dbkit_core::driver::{Connection, Database};
use dbkit_core::error::{DbkitError, Result, ResultExt};
use dbkit_core::fault;
use dbkit_core::registry::DatabaseRegistry;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Driver name the PostgreSQL backend registers under.
pub const DRIVER_NAME: &str = "pg";

#[derive(Debug, Default)]
pub(crate) struct PoolState {
    pub(crate) connections: usize,
    pub(crate) closed: bool,
}

pub(crate) struct PoolShared {
    pub(crate) pool: PgPool,
    pub(crate) state: Mutex<PoolState>,
}

/// A pool of PostgreSQL sessions.
pub struct PostgresDatabase {
    shared: Arc<PoolShared>,
}

impl PostgresDatabase {
    /// Open a pool and ping the server.
    pub async fn connect(cancel: &CancellationToken, config: &PgConfig) -> Result<Self> {
        let options = config.connect_options();
        let pool = fault::guard(
            "connecting to postgres",
            cancel::run_until_cancelled(cancel, async {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(config.acquire_timeout)
                    .connect_with(options)
                    .await?;
                sqlx::query("SELECT 1").execute(&pool).await?;
                Ok(pool)
            }),
        )
        .await
        .with_context(|| {
            format!(
                "failed to connect to postgres at {}:{}/{}",
                config.host, config.port, config.name
            )
        })?;

        info!(host = %config.host, port = config.port, database = %config.name, "Connected to postgres");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing sqlx pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                pool,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Factory used by the driver registry.
    pub async fn open(
        driver: DriverConfig,
        _global: GlobalConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn Database>> {
        let config = PgConfig::from_driver(&driver)?;
        let database = Self::connect(&cancel, &config).await?;
        Ok(Arc::new(database))
    }

    pub fn register(registry: &mut DatabaseRegistry) -> Result<()> {
        registry.register(DRIVER_NAME, Self::open)
    }

    /// Number of connections not yet closed.
    pub async fn live_connections(&self) -> usize {
        self.shared.state.lock().await.connections
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn acquire_connection(&self, cancel: &CancellationToken) -> Result<Box<dyn Connection>> {
        cancel::check(cancel)?;
        if self.shared.state.lock().await.closed {
            return Err(DbkitError::PoolClosed);
        }

        let session = fault::guard(
            "acquiring connection",
            cancel::run_until_cancelled(cancel, async {
                Ok(self.shared.pool.acquire().await?)
            }),
        )
        .await?;

        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(DbkitError::PoolClosed);
        }
        state.connections += 1;

        debug!(live = state.connections, "Postgres connection acquired");
        Ok(Box::new(PostgresConnection::new(
            session,
            Arc::clone(&self.shared),
        )))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.connections > 0 {
            return Err(DbkitError::PoolNotEmpty(state.connections));
        }
        if !state.closed {
            state.closed = true;
            self.shared.pool.close().await;
            debug!("Postgres pool closed");
        }
        Ok(())
    }
}
