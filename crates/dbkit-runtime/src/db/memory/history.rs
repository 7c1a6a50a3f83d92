use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dbkit_core::cancel;
use dbkit_core::driver::{AppliedMigration, AppliedMigrationStore};
use dbkit_core::error::{DbkitError, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Applied migration history kept in memory.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    rows: Mutex<Vec<AppliedMigration>>,
    schema_ready: AtomicBool,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, bypassing the recording protocol.
    pub async fn insert(&self, row: AppliedMigration) {
        self.rows.lock().await.push(row);
    }

    /// Snapshot of all rows in insertion order.
    pub async fn rows(&self) -> Vec<AppliedMigration> {
        self.rows.lock().await.clone()
    }

    /// Whether `ensure_schema` has been called.
    pub fn schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::SeqCst)
    }

    async fn update(&self, id: &str, apply: impl FnOnce(&mut AppliedMigration)) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| DbkitError::NotFound(format!("applied migration '{}'", id)))?;
        apply(row);
        Ok(())
    }
}

#[async_trait]
impl AppliedMigrationStore for MemoryHistory {
    async fn ensure_schema(&self, cancel: &CancellationToken) -> Result<()> {
        cancel::check(cancel)?;
        self.schema_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<AppliedMigration>> {
        cancel::check(cancel)?;
        let mut rows = self.rows.lock().await.clone();
        rows.sort_by_key(|row| row.started_at);
        Ok(rows)
    }

    async fn remove(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        cancel::check(cancel)?;
        let mut rows = self.rows.lock().await;
        let index = rows
            .iter()
            .position(|row| row.id == id)
            .ok_or_else(|| DbkitError::NotFound(format!("applied migration '{}'", id)))?;
        rows.remove(index);
        Ok(())
    }

    async fn record_started(
        &self,
        cancel: &CancellationToken,
        id: &str,
        checksum: &str,
    ) -> Result<()> {
        cancel::check(cancel)?;
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|row| row.id == id) {
            return Err(DbkitError::AlreadyExists(format!("applied migration '{}'", id)));
        }
        rows.push(AppliedMigration::started(id, checksum));
        Ok(())
    }

    async fn record_finished(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        cancel::check(cancel)?;
        self.update(id, |row| row.finished_at = Some(Utc::now())).await
    }

    async fn record_rollback_started(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        cancel::check(cancel)?;
        self.update(id, |row| row.rollback_started_at = Some(Utc::now()))
            .await
    }
}
