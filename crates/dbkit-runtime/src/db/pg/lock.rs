use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::driver::{Lock, MIGRATION_LOCK_ID};
use dbkit_core::error::{DbkitError, Result};
use dbkit_core::fault;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::Session;

/// One hold on the session level advisory lock.
pub struct PostgresLock {
    session: Arc<Session>,
}

impl PostgresLock {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Lock for PostgresLock {
    async fn release(&self, cancel: &CancellationToken) -> Result<()> {
        fault::guard(
            "releasing migration lock",
            cancel::run_until_cancelled(cancel, async {
                let mut guard = self.session.lock().await;
                // Closing the connection already dropped every hold.
                let Some(conn) = guard.as_deref_mut() else {
                    return Err(DbkitError::LockNotHeld);
                };

                let (released,): (bool,) = sqlx::query_as("SELECT pg_advisory_unlock($1)")
                    .bind(MIGRATION_LOCK_ID)
                    .fetch_one(conn)
                    .await?;
                if !released {
                    return Err(DbkitError::LockNotHeld);
                }

                let _ = self.session.lock_holds.fetch_update(
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    |holds| holds.checked_sub(1),
                );
                debug!(lock_id = MIGRATION_LOCK_ID, "Migration lock released");
                Ok(())
            }),
        )
        .await
    }
}
