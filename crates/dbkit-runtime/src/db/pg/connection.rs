use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::driver::{AppliedMigrationStore, Connection, Lock, Transaction, MIGRATION_LOCK_ID};
use dbkit_core::error::{DbkitError, Result};
use dbkit_core::fault;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, PgConnection, Postgres};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::history::PostgresHistory;
use super::lock::PostgresLock;
use super::transaction::PostgresTransaction;
use super::PoolShared;

/// The pooled session behind a [`PostgresConnection`].
///
/// `conn` is `None` once the connection has been closed.
pub(crate) struct Session {
    pool: Arc<PoolShared>,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
    pub(crate) transaction_open: AtomicBool,
    pub(crate) lock_holds: AtomicUsize,
}

impl Session {
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Option<PoolConnection<Postgres>>> {
        self.conn.lock().await
    }

    /// Run SQL text, possibly several statements, on the session.
    pub(crate) async fn exec(&self, sql: &str) -> Result<()> {
        let mut guard = self.lock().await;
        let conn = live(&mut guard)?;
        conn.execute(sqlx::raw_sql(sql)).await?;
        Ok(())
    }
}

/// The live session behind a guard, or `ConnectionClosed`.
pub(crate) fn live(guard: &mut Option<PoolConnection<Postgres>>) -> Result<&mut PgConnection> {
    guard.as_deref_mut().ok_or(DbkitError::ConnectionClosed)
}

/// A connection holding one pooled PostgreSQL session.
pub struct PostgresConnection {
    session: Arc<Session>,
}

impl PostgresConnection {
    pub(crate) fn new(conn: PoolConnection<Postgres>, pool: Arc<PoolShared>) -> Self {
        Self {
            session: Arc::new(Session {
                pool,
                conn: Mutex::new(Some(conn)),
                transaction_open: AtomicBool::new(false),
                lock_holds: AtomicUsize::new(0),
            }),
        }
    }

    /// Restore a session that is going back to the pool.
    async fn reset(&self, conn: &mut PgConnection) -> Result<()> {
        if self.session.transaction_open.swap(false, Ordering::SeqCst) {
            conn.execute(sqlx::raw_sql("ROLLBACK")).await?;
        }
        if self.session.lock_holds.swap(0, Ordering::SeqCst) > 0 {
            sqlx::query("SELECT pg_advisory_unlock_all()")
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn try_acquire_lock(&self, cancel: &CancellationToken) -> Result<Box<dyn Lock>> {
        let acquired = fault::guard(
            "acquiring migration lock",
            cancel::run_until_cancelled(cancel, async {
                let mut guard = self.session.lock().await;
                let conn = live(&mut guard)?;
                let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
                    .bind(MIGRATION_LOCK_ID)
                    .fetch_one(conn)
                    .await?;
                if acquired {
                    self.session.lock_holds.fetch_add(1, Ordering::SeqCst);
                }
                Ok(acquired)
            }),
        )
        .await?;

        if !acquired {
            return Err(DbkitError::LockHeld);
        }
        debug!(lock_id = MIGRATION_LOCK_ID, "Migration lock acquired");
        Ok(Box::new(PostgresLock::new(Arc::clone(&self.session))))
    }

    async fn close(&self) -> Result<()> {
        fault::guard("closing connection", async {
            let Some(mut conn) = self.session.lock().await.take() else {
                return Ok(());
            };

            let reset = self.reset(&mut conn).await;
            {
                let mut state = self.session.pool.state.lock().await;
                state.connections = state.connections.saturating_sub(1);
                debug!(live = state.connections, "Postgres connection closed");
            }

            match reset {
                Ok(()) => drop(conn),
                Err(e) => {
                    // A session in an unknown state must not be reused.
                    warn!(error = %e, "Failed to reset session, discarding it");
                    drop(conn.detach());
                }
            }
            Ok(())
        })
        .await
    }

    fn applied_migrations(&self) -> Arc<dyn AppliedMigrationStore> {
        Arc::new(PostgresHistory::new(Arc::clone(&self.session)))
    }

    async fn exec(&self, cancel: &CancellationToken, sql: &str) -> Result<()> {
        fault::guard(
            "executing statement",
            cancel::run_until_cancelled(cancel, self.session.exec(sql)),
        )
        .await
    }

    async fn begin(&self, cancel: &CancellationToken) -> Result<Box<dyn Transaction>> {
        cancel::check(cancel)?;
        if self.session.lock().await.is_none() {
            return Err(DbkitError::ConnectionClosed);
        }
        if self
            .session
            .transaction_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DbkitError::TransactionInProgress);
        }

        let begun = fault::guard(
            "beginning transaction",
            cancel::run_until_cancelled(cancel, self.session.exec("BEGIN")),
        )
        .await;
        if let Err(e) = begun {
            self.session.transaction_open.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(Box::new(PostgresTransaction::new(Arc::clone(&self.session))))
    }
}
