//! Seed runner.
//!
//! Seeds are plain SQL sources run in id order, each inside its own
//! transaction. Nothing is recorded about which seeds already ran.

use std::sync::Arc;

use chrono::Local;
use dbkit_core::config::DbkitConfig;
use dbkit_core::driver::Connection;
use dbkit_core::error::{Result, ResultExt};
use dbkit_core::registry::{DatabaseRegistry, SourceRegistry};
use dbkit_core::source::{Source, Store};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::session::Session;

pub struct SeedRunner {
    config: Arc<DbkitConfig>,
    databases: Arc<DatabaseRegistry>,
    sources: Arc<SourceRegistry>,
}

impl SeedRunner {
    pub fn new(
        config: Arc<DbkitConfig>,
        databases: Arc<DatabaseRegistry>,
        sources: Arc<SourceRegistry>,
    ) -> Self {
        Self {
            config,
            databases,
            sources,
        }
    }

    /// Run every seed under the migration lock, stopping at the first
    /// failure. Returns the ids that ran.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let store = self.store(cancel).await?;
        let seeds = store
            .list(cancel)
            .await
            .context("failed to list seeds from store")?;

        let database = self
            .databases
            .open_database(cancel, &self.config, &self.config.active.database)
            .await
            .context("failed to load db driver")?;
        let session = Session::open(cancel, database, true).await?;

        let mut ran = Vec::with_capacity(seeds.len());
        let mut result = Ok(());
        for seed in &seeds {
            if let Err(e) = exec_seed(cancel, session.connection(), seed).await {
                result = Err(e.context(format!("failed to execute seed {}", seed.id())));
                break;
            }
            info!(id = seed.id(), "Seed ran successfully");
            ran.push(seed.id().to_string());
        }

        session.close(self.config.runtime.rollback_timeout()).await;
        result.map(|()| ran)
    }

    /// Create an empty seed named `<timestamp>_<name>`.
    pub async fn create(&self, cancel: &CancellationToken, name: &str) -> Result<String> {
        let id = format!("{}_{}", Local::now().format("%Y-%m-%d_%H-%M-%S"), name);
        self.store(cancel).await?.create(cancel, &id, "").await?;
        info!(id = %id, "Seed created");
        Ok(id)
    }

    async fn store(&self, cancel: &CancellationToken) -> Result<Arc<dyn Store>> {
        let target = &self.config.active.source.seeds;
        self.sources
            .open_store(cancel, &self.config, target)
            .await
            .with_context(|| format!("failed to load seed source '{}'", target))
    }
}

async fn exec_seed(cancel: &CancellationToken, conn: &dyn Connection, seed: &Source) -> Result<()> {
    let contents = seed.contents(cancel).await?;
    let transaction = conn
        .begin(cancel)
        .await
        .context("failed to begin transaction")?;

    match transaction.exec(cancel, &contents).await {
        Ok(()) => transaction.commit(cancel).await,
        Err(e) => {
            if let Err(rollback) = transaction.rollback(cancel).await {
                warn!(id = seed.id(), error = %rollback, "Failed to roll back seed transaction");
            }
            Err(e)
        }
    }
}
