use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::driver::{AppliedMigrationStore, Connection, Lock, Transaction};
use dbkit_core::error::{DbkitError, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::lock::MemoryLock;
use super::transaction::MemoryTransaction;
use super::PoolShared;

pub(crate) struct ConnectionShared {
    pub(crate) id: u64,
    pub(crate) pool: Arc<PoolShared>,
    pub(crate) closed: AtomicBool,
    pub(crate) transaction_open: AtomicBool,
}

impl ConnectionShared {
    pub(crate) async fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbkitError::ConnectionClosed);
        }
        if self.pool.state.lock().await.closed {
            return Err(DbkitError::PoolClosed);
        }
        Ok(())
    }
}

/// A connection from a [`MemoryDatabase`](super::MemoryDatabase).
pub struct MemoryConnection {
    shared: Arc<ConnectionShared>,
}

impl MemoryConnection {
    pub(crate) fn new(id: u64, pool: Arc<PoolShared>) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                id,
                pool,
                closed: AtomicBool::new(false),
                transaction_open: AtomicBool::new(false),
            }),
        }
    }

    /// Server-wide connection id, as reported by `MemoryServer::lock_owner`.
    pub fn id(&self) -> u64 {
        self.shared.id
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn try_acquire_lock(&self, cancel: &CancellationToken) -> Result<Box<dyn Lock>> {
        cancel::check(cancel)?;
        let server = &self.shared.pool.server;
        let mut lock = server.lock.lock().await;
        self.shared.ensure_open().await?;

        match lock.owner {
            None => {
                lock.owner = Some(self.shared.id);
                lock.count = 1;
            }
            Some(owner) if owner == self.shared.id => lock.count += 1,
            Some(_) => return Err(DbkitError::LockHeld),
        }
        debug!(connection_id = self.shared.id, holds = lock.count, "Memory lock acquired");
        Ok(Box::new(MemoryLock::new(Arc::clone(&self.shared))))
    }

    async fn close(&self) -> Result<()> {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        {
            let mut lock = self.shared.pool.server.lock.lock().await;
            if lock.owner == Some(self.shared.id) {
                lock.owner = None;
                lock.count = 0;
            }
        }
        self.shared.transaction_open.store(false, Ordering::SeqCst);

        let mut state = self.shared.pool.state.lock().await;
        state.connections = state.connections.saturating_sub(1);
        debug!(connection_id = self.shared.id, live = state.connections, "Memory connection closed");
        Ok(())
    }

    fn applied_migrations(&self) -> Arc<dyn AppliedMigrationStore> {
        self.shared.pool.server.history()
    }

    async fn exec(&self, cancel: &CancellationToken, sql: &str) -> Result<()> {
        cancel::check(cancel)?;
        self.shared.ensure_open().await?;
        let server = &self.shared.pool.server;
        server.check_statement(sql).await?;
        server.apply([sql.to_string()]).await;
        Ok(())
    }

    async fn begin(&self, cancel: &CancellationToken) -> Result<Box<dyn Transaction>> {
        cancel::check(cancel)?;
        self.shared.ensure_open().await?;
        if self
            .shared
            .transaction_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DbkitError::TransactionInProgress);
        }
        Ok(Box::new(MemoryTransaction::new(Arc::clone(&self.shared))))
    }
}
