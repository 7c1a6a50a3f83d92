use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::driver::Transaction;
use dbkit_core::error::{DbkitError, Result};
use dbkit_core::fault;
use tokio_util::sync::CancellationToken;

use super::connection::Session;

/// A `BEGIN` ... `COMMIT`/`ROLLBACK` block on a pooled session.
pub struct PostgresTransaction {
    session: Arc<Session>,
    finished: AtomicBool,
}

impl PostgresTransaction {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            finished: AtomicBool::new(false),
        }
    }

    async fn finish(&self, cancel: &CancellationToken, statement: &'static str) -> Result<()> {
        cancel::check(cancel)?;
        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DbkitError::NoTransaction);
        }

        let result = fault::guard(
            "finishing transaction",
            cancel::run_until_cancelled(cancel, self.session.exec(statement)),
        )
        .await;
        self.session.transaction_open.store(false, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn commit(&self, cancel: &CancellationToken) -> Result<()> {
        self.finish(cancel, "COMMIT").await
    }

    async fn rollback(&self, cancel: &CancellationToken) -> Result<()> {
        self.finish(cancel, "ROLLBACK").await
    }

    async fn exec(&self, cancel: &CancellationToken, sql: &str) -> Result<()> {
        cancel::check(cancel)?;
        if self.finished.load(Ordering::SeqCst) {
            return Err(DbkitError::NoTransaction);
        }
        fault::guard(
            "executing statement in transaction",
            cancel::run_until_cancelled(cancel, self.session.exec(sql)),
        )
        .await
    }
}
