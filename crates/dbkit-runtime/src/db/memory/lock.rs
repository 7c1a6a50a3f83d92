use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::driver::Lock;
use dbkit_core::error::{DbkitError, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::ConnectionShared;

/// A hold on a memory server's lock.
///
/// Each release drops one hold of the owning connection; the lock is free
/// once no holds remain.
pub struct MemoryLock {
    conn: Arc<ConnectionShared>,
}

impl MemoryLock {
    pub(crate) fn new(conn: Arc<ConnectionShared>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Lock for MemoryLock {
    async fn release(&self, cancel: &CancellationToken) -> Result<()> {
        cancel::check(cancel)?;
        let mut lock = self.conn.pool.server.lock.lock().await;
        if lock.owner != Some(self.conn.id) {
            return Err(DbkitError::LockNotHeld);
        }

        if lock.count <= 1 {
            lock.owner = None;
            lock.count = 0;
        } else {
            lock.count -= 1;
        }
        debug!(connection_id = self.conn.id, holds = lock.count, "Memory lock released");
        Ok(())
    }
}
