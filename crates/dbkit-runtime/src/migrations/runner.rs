//! Migration runner guarded by the migration lock.
//!
//! Only one process applies migrations against a database at a time: the run
//! takes the lock without waiting and reports contention as an error.

use std::sync::Arc;

use chrono::Local;
use dbkit_core::config::DbkitConfig;
use dbkit_core::driver::{AppliedMigration, AppliedMigrationStore, Connection};
use dbkit_core::error::{DbkitError, Result, ResultExt};
use dbkit_core::registry::{DatabaseRegistry, SourceRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::source::MigrationSource;
use super::source_store::{MigrationSourceStore, MigrationStatus};
use super::Direction;
use crate::session::Session;

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub direction: Direction,
    /// Ids that ran, in the order they ran.
    pub applied: Vec<String>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Runs, creates and inspects migrations for the active configuration.
pub struct MigrationRunner {
    config: Arc<DbkitConfig>,
    databases: Arc<DatabaseRegistry>,
    sources: Arc<SourceRegistry>,
}

impl MigrationRunner {
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

    /// Apply pending migrations in `direction`, at most `steps` of them.
    ///
    /// Stops at the first failure; whatever completed before it stays
    /// recorded. A history left dirty by an earlier crash is refused.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        direction: Direction,
        steps: Option<usize>,
    ) -> Result<MigrationReport> {
        let sources = self.source_store(cancel).await?;
        let session = self.open_session(cancel, true).await?;

        let result = apply_pending(cancel, &sources, session.connection(), direction, steps).await;
        session.close(self.config.runtime.rollback_timeout()).await;
        result
    }

    /// Create an empty migration pair named `<timestamp>_<name>`.
    pub async fn create(&self, cancel: &CancellationToken, name: &str) -> Result<String> {
        let id = format!("{}_{}", Local::now().format("%Y-%m-%d_%H-%M-%S"), name);
        let sources = self.source_store(cancel).await?;
        sources.create(cancel, &id, "").await?;
        info!(id = %id, "Migration created");
        Ok(id)
    }

    /// Applied history and pending ids. Takes no lock and changes nothing
    /// beyond creating the history table.
    pub async fn status(&self, cancel: &CancellationToken) -> Result<MigrationStatus> {
        let sources = self.source_store(cancel).await?;
        let session = self.open_session(cancel, false).await?;

        let result = async {
            let history = session.connection().applied_migrations();
            let applied = load_history(cancel, history.as_ref()).await?;
            sources
                .status(cancel, applied)
                .await
                .context("failed to get pending migrations")
        }
        .await;
        session.close(self.config.runtime.rollback_timeout()).await;
        result
    }

    async fn source_store(&self, cancel: &CancellationToken) -> Result<MigrationSourceStore> {
        let active = &self.config.active.source.migrations;
        let up = self
            .sources
            .open_store(cancel, &self.config, &active.up)
            .await
            .with_context(|| format!("failed to load up migration source '{}'", active.up))?;
        let down = self
            .sources
            .open_store(cancel, &self.config, &active.down)
            .await
            .with_context(|| format!("failed to load down migration source '{}'", active.down))?;

        Ok(MigrationSourceStore::new(cancel, up, down)
            .await?
            .with_rollback_timeout(self.config.runtime.rollback_timeout()))
    }

    async fn open_session(&self, cancel: &CancellationToken, locked: bool) -> Result<Session> {
        let database = self
            .databases
            .open_database(cancel, &self.config, &self.config.active.database)
            .await
            .context("failed to load db driver")?;
        Session::open(cancel, database, locked).await
    }
}

async fn load_history(
    cancel: &CancellationToken,
    history: &dyn AppliedMigrationStore,
) -> Result<Vec<AppliedMigration>> {
    history
        .ensure_schema(cancel)
        .await
        .context("failed to ensure applied migration schema exists")?;
    history
        .list(cancel)
        .await
        .context("failed to list applied migrations")
}

/// Refuse to build on a migration or rollback that never completed.
pub(crate) fn ensure_clean_state(applied: &[AppliedMigration]) -> Result<()> {
    for row in applied {
        if row.finished_at.is_none() {
            return Err(DbkitError::CorruptedState(format!(
                "{} migration was started but did not successfully complete",
                row.id
            )));
        }
        if row.rollback_started_at.is_some() {
            return Err(DbkitError::CorruptedState(format!(
                "a rollback was started for migration {} but did not successfully complete",
                row.id
            )));
        }
    }
    Ok(())
}

async fn apply_pending(
    cancel: &CancellationToken,
    sources: &MigrationSourceStore,
    conn: &dyn Connection,
    direction: Direction,
    steps: Option<usize>,
) -> Result<MigrationReport> {
    let history = conn.applied_migrations();
    let applied = load_history(cancel, history.as_ref()).await?;
    ensure_clean_state(&applied)?;

    let pending = sources
        .pending(cancel, &applied, direction)
        .await
        .context("failed to get pending migrations")?;

    let mut report = MigrationReport {
        direction,
        applied: Vec::new(),
    };
    if pending.is_empty() {
        info!(%direction, "No pending migrations");
        return Ok(report);
    }

    let limit = steps.unwrap_or(usize::MAX);
    for source in pending.iter().take(limit) {
        apply_one(cancel, history.as_ref(), conn, source, direction).await?;
        report.applied.push(source.id().to_string());
    }
    Ok(report)
}

async fn apply_one(
    cancel: &CancellationToken,
    history: &dyn AppliedMigrationStore,
    conn: &dyn Connection,
    source: &MigrationSource,
    direction: Direction,
) -> Result<()> {
    let id = source.id();
    let contents = source
        .contents(cancel)
        .await
        .with_context(|| format!("failed to read migration {}", id))?;

    debug!(id, %direction, checksum = %contents.checksum, "Starting migration");
    let sql = match direction {
        Direction::Up => {
            history
                .record_started(cancel, id, &contents.checksum)
                .await
                .with_context(|| format!("failed to record migration {} start", id))?;
            &contents.up
        }
        Direction::Down => {
            history
                .record_rollback_started(cancel, id)
                .await
                .with_context(|| format!("failed to record migration {} rollback start", id))?;
            &contents.down
        }
    };

    conn.exec(cancel, sql)
        .await
        .with_context(|| format!("failed to execute {} migration {}", direction, id))?;

    match direction {
        Direction::Up => history
            .record_finished(cancel, id)
            .await
            .with_context(|| format!("failed to record migration {} finish", id))?,
        Direction::Down => history
            .remove(cancel, id)
            .await
            .with_context(|| format!("failed to record migration {} rollback finish", id))?,
    }

    info!(id, %direction, "Migration ran successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_clean_state() {
        assert!(ensure_clean_state(&[]).is_ok());
        assert!(ensure_clean_state(&[AppliedMigration::finished("0001_a", "x")]).is_ok());

        let err = ensure_clean_state(&[AppliedMigration::started("0001_a", "x")]).unwrap_err();
        assert!(matches!(err, DbkitError::CorruptedState(_)));
        assert!(err.to_string().contains("did not successfully complete"));

        let mut rolling_back = AppliedMigration::finished("0001_a", "x");
        rolling_back.rollback_started_at = Some(Utc::now());
        let err = ensure_clean_state(&[rolling_back]).unwrap_err();
        assert!(err.to_string().contains("a rollback was started"));
    }

    #[test]
    fn test_report_and_direction_display() {
        let report = MigrationReport {
            direction: Direction::Down,
            applied: Vec::new(),
        };
        assert!(report.is_empty());
        assert_eq!(Direction::Up.to_string(), "up");
        assert_eq!(Direction::Down.to_string(), "down");
    }
}
