use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dbkit_core::cancel;
use dbkit_core::driver::{AppliedMigration, AppliedMigrationStore};
use dbkit_core::error::{DbkitError, Result};
use dbkit_core::fault;
use sqlx::postgres::PgQueryResult;
use tokio_util::sync::CancellationToken;

use super::connection::{live, Session};

type HistoryRow = (
    String,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

/// The `migrations` table, read and written through the owning session.
pub struct PostgresHistory {
    session: Arc<Session>,
}

impl PostgresHistory {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    async fn modify(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        sql: &'static str,
        id: &str,
    ) -> Result<PgQueryResult> {
        fault::guard(
            operation,
            cancel::run_until_cancelled(cancel, async {
                let mut guard = self.session.lock().await;
                let conn = live(&mut guard)?;
                Ok(sqlx::query(sql).bind(id).execute(conn).await?)
            }),
        )
        .await
    }
}

fn expect_one_row(result: PgQueryResult, id: &str) -> Result<()> {
    match result.rows_affected() {
        1 => Ok(()),
        0 => Err(DbkitError::NotFound(format!("applied migration '{}'", id))),
        n => Err(DbkitError::Database(format!(
            "expected one history row for '{}', {} were affected",
            id, n
        ))),
    }
}

#[async_trait]
impl AppliedMigrationStore for PostgresHistory {
    async fn ensure_schema(&self, cancel: &CancellationToken) -> Result<()> {
        fault::guard(
            "creating migrations table",
            cancel::run_until_cancelled(
                cancel,
                self.session.exec(
                    r#"
                    CREATE TABLE IF NOT EXISTS migrations (
                        id VARCHAR(255) PRIMARY KEY,
                        checksum VARCHAR(255),
                        started_at TIMESTAMPTZ NOT NULL,
                        finished_at TIMESTAMPTZ,
                        rollback_started_at TIMESTAMPTZ
                    )
                    "#,
                ),
            ),
        )
        .await
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<AppliedMigration>> {
        let rows: Vec<HistoryRow> = fault::guard(
            "listing applied migrations",
            cancel::run_until_cancelled(cancel, async {
                let mut guard = self.session.lock().await;
                let conn = live(&mut guard)?;
                Ok(sqlx::query_as::<_, HistoryRow>(
                    "SELECT id, checksum, started_at, finished_at, rollback_started_at \
                     FROM migrations ORDER BY started_at ASC, id ASC",
                )
                .fetch_all(conn)
                .await?)
            }),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, checksum, started_at, finished_at, rollback_started_at)| AppliedMigration {
                    id,
                    checksum: checksum.unwrap_or_default(),
                    started_at,
                    finished_at,
                    rollback_started_at,
                },
            )
            .collect())
    }

    async fn remove(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        let result = self
            .modify(
                cancel,
                "removing applied migration",
                "DELETE FROM migrations WHERE id = $1",
                id,
            )
            .await?;
        expect_one_row(result, id)
    }

    async fn record_started(
        &self,
        cancel: &CancellationToken,
        id: &str,
        checksum: &str,
    ) -> Result<()> {
        let result = fault::guard(
            "recording migration start",
            cancel::run_until_cancelled(cancel, async {
                let mut guard = self.session.lock().await;
                let conn = live(&mut guard)?;
                Ok(sqlx::query(
                    "INSERT INTO migrations (id, checksum, started_at) VALUES ($1, $2, NOW()) \
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(id)
                .bind(checksum)
                .execute(conn)
                .await?)
            }),
        )
        .await?;

        if result.rows_affected() != 1 {
            return Err(DbkitError::AlreadyExists(format!(
                "applied migration '{}'",
                id
            )));
        }
        Ok(())
    }

    async fn record_finished(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        let result = self
            .modify(
                cancel,
                "recording migration finish",
                "UPDATE migrations SET finished_at = NOW() WHERE id = $1",
                id,
            )
            .await?;
        expect_one_row(result, id)
    }

    async fn record_rollback_started(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        let result = self
            .modify(
                cancel,
                "recording rollback start",
                "UPDATE migrations SET rollback_started_at = NOW() WHERE id = $1",
                id,
            )
            .await?;
        expect_one_row(result, id)
    }
}
