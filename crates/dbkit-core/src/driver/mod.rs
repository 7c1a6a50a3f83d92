//! Contracts every database backend implements.
//!
//! Every operation takes a [`CancellationToken`]. A token that has already
//! fired makes the call fail with [`DbkitError::Cancelled`] before it touches
//! any state.
//!
//! [`DbkitError::Cancelled`]: crate::error::DbkitError::Cancelled

mod applied;

pub use applied::AppliedMigration;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// The single advisory lock key shared by every dbkit process.
pub const MIGRATION_LOCK_ID: i64 = 3_955_278_872;

/// A pool of connections to one logical database.
#[async_trait]
pub trait Database: Send + Sync {
    /// Take a connection out of the pool. The pool counts it as live until
    /// [`Connection::close`] is called.
    async fn acquire_connection(&self, cancel: &CancellationToken) -> Result<Box<dyn Connection>>;

    /// Close the pool.
    ///
    /// Fails with `PoolNotEmpty` while connections are live. Closing an
    /// already closed pool succeeds.
    async fn close(&self) -> Result<()>;
}

/// One pooled session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Non-blocking attempt to take the migration lock.
    ///
    /// The lock is reentrant per connection: each successful call must be
    /// matched by one [`Lock::release`]. Fails with `LockHeld` when another
    /// connection owns it.
    async fn try_acquire_lock(&self, cancel: &CancellationToken) -> Result<Box<dyn Lock>>;

    /// Return the connection to its pool. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Bookkeeping for applied migrations on this connection.
    fn applied_migrations(&self) -> Arc<dyn AppliedMigrationStore>;

    /// Execute SQL text outside of any transaction.
    async fn exec(&self, cancel: &CancellationToken, sql: &str) -> Result<()>;

    /// Open a transaction. At most one may be open per connection.
    async fn begin(&self, cancel: &CancellationToken) -> Result<Box<dyn Transaction>>;
}

/// An open transaction. Exactly one of commit or rollback succeeds, once.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn commit(&self, cancel: &CancellationToken) -> Result<()>;

    async fn rollback(&self, cancel: &CancellationToken) -> Result<()>;

    async fn exec(&self, cancel: &CancellationToken, sql: &str) -> Result<()>;
}

/// One hold on the migration lock.
#[async_trait]
pub trait Lock: Send + Sync {
    async fn release(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Persisted history of applied migrations.
#[async_trait]
pub trait AppliedMigrationStore: Send + Sync {
    /// Create the history table if it does not exist.
    async fn ensure_schema(&self, cancel: &CancellationToken) -> Result<()>;

    /// All rows ordered by `started_at` ascending.
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<AppliedMigration>>;

    /// Delete the row once its rollback has completed.
    async fn remove(&self, cancel: &CancellationToken, id: &str) -> Result<()>;

    async fn record_started(&self, cancel: &CancellationToken, id: &str, checksum: &str)
        -> Result<()>;

    async fn record_finished(&self, cancel: &CancellationToken, id: &str) -> Result<()>;

    async fn record_rollback_started(&self, cancel: &CancellationToken, id: &str) -> Result<()>;
}
