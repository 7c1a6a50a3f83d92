use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::driver::Transaction;
use dbkit_core::error::{DbkitError, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionShared;

/// A transaction buffering its statements until commit.
pub struct MemoryTransaction {
    conn: Arc<ConnectionShared>,
    finished: AtomicBool,
    pending: Mutex<Vec<String>>,
}

impl MemoryTransaction {
    pub(crate) fn new(conn: Arc<ConnectionShared>) -> Self {
        Self {
            conn,
            finished: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn finish(&self) -> Result<()> {
        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DbkitError::NoTransaction);
        }
        self.conn.transaction_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// End the transaction and hand back its buffer. A closed connection
    /// has already rolled the transaction back, so the buffer is dropped.
    async fn take_pending(&self) -> Result<Vec<String>> {
        self.finish()?;
        let statements = std::mem::take(&mut *self.pending.lock().await);
        self.conn.ensure_open().await?;
        Ok(statements)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(&self, cancel: &CancellationToken) -> Result<()> {
        cancel::check(cancel)?;
        let statements = self.take_pending().await?;
        self.conn.pool.server.apply(statements).await;
        Ok(())
    }

    async fn rollback(&self, cancel: &CancellationToken) -> Result<()> {
        cancel::check(cancel)?;
        self.take_pending().await?;
        Ok(())
    }

    async fn exec(&self, cancel: &CancellationToken, sql: &str) -> Result<()> {
        cancel::check(cancel)?;
        if self.finished.load(Ordering::SeqCst) {
            return Err(DbkitError::NoTransaction);
        }
        self.conn.ensure_open().await?;
        self.conn.pool.server.check_statement(sql).await?;
        self.pending.lock().await.push(sql.to_string());
        Ok(())
    }
}
