//! A connection taken from a freshly opened database, optionally holding the
//! migration lock, torn down in reverse order on every exit path.

use std::sync::Arc;
use std::time::Duration;

use dbkit_core::cancel;
use dbkit_core::driver::{Connection, Database, Lock};
use dbkit_core::error::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) struct Session {
    database: Arc<dyn Database>,
    conn: Box<dyn Connection>,
    lock: Option<Box<dyn Lock>>,
}

impl Session {
    /// Acquire a connection and, when `locked`, the migration lock.
    ///
    /// Whatever was opened before a failure is closed again before the error
    /// is returned.
    pub(crate) async fn open(
        cancel: &CancellationToken,
        database: Arc<dyn Database>,
        locked: bool,
    ) -> Result<Self> {
        let conn = match database.acquire_connection(cancel).await {
            Ok(conn) => conn,
            Err(e) => {
                close_database(database.as_ref()).await;
                return Err(e.context("failed to acquire db connection"));
            }
        };

        let lock = if locked {
            match conn.try_acquire_lock(cancel).await {
                Ok(lock) => Some(lock),
                Err(e) => {
                    close_connection(conn.as_ref()).await;
                    close_database(database.as_ref()).await;
                    return Err(e.context("failed to acquire lock"));
                }
            }
        } else {
            None
        };

        Ok(Self {
            database,
            conn,
            lock,
        })
    }

    pub(crate) fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    /// Release the lock, close the connection, then close the database.
    ///
    /// Runs under its own deadline so it still happens after the caller's
    /// token fired. Failures are logged, never returned.
    pub(crate) async fn close(self, timeout: Duration) {
        let cleanup = cancel::detached_deadline(timeout);
        if let Some(lock) = &self.lock {
            match lock.release(&cleanup).await {
                Ok(()) => debug!("Migration lock released"),
                Err(e) => warn!(error = %e, "Failed to release migration lock"),
            }
        }
        cleanup.cancel();

        close_connection(self.conn.as_ref()).await;
        close_database(self.database.as_ref()).await;
    }
}

async fn close_connection(conn: &dyn Connection) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "Failed to close db connection");
    }
}

async fn close_database(database: &dyn Database) {
    if let Err(e) = database.close().await {
        warn!(error = %e, "Failed to close database");
    }
}
