//! In-memory database driver.
//!
//! Simulates the full driver contract without a storage engine: pool
//! accounting, idempotent close, reentrant lock counting, single open
//! transaction per connection and cancellation checks. A [`MemoryServer`]
//! plays the role of one logical database, so every pool opened against the
//! same server contends for the same lock and sees the same history.

mod connection;
mod history;
mod lock;
mod transaction;

pub use connection::MemoryConnection;
pub use history::MemoryHistory;
pub use lock::MemoryLock;
pub use transaction::MemoryTransaction;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::cancel;
use dbkit_core::driver::{Connection, Database};
use dbkit_core::error::{DbkitError, Result};
use dbkit_core::registry::DatabaseRegistry;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Driver name the memory backend registers under.
pub const DRIVER_NAME: &str = "memory";

#[derive(Debug, Default)]
pub(crate) struct LockState {
    pub(crate) owner: Option<u64>,
    pub(crate) count: usize,
}

/// One logical in-memory database.
pub struct MemoryServer {
    pub(crate) lock: Mutex<LockState>,
    history: Arc<MemoryHistory>,
    executed: Mutex<Vec<String>>,
    rejected: Mutex<Vec<String>>,
    next_connection_id: AtomicU64,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Self::with_history(Arc::new(MemoryHistory::new()))
    }

    /// A server whose history store is shared with the caller.
    pub fn with_history(history: Arc<MemoryHistory>) -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(LockState::default()),
            history,
            executed: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// The applied migration history.
    pub fn history(&self) -> Arc<MemoryHistory> {
        Arc::clone(&self.history)
    }

    /// Make every statement containing `pattern` fail as if it were invalid.
    pub async fn reject_statements_containing(&self, pattern: impl Into<String>) {
        self.rejected.lock().await.push(pattern.into());
    }

    /// Statements that took effect, in order. Statements of rolled back
    /// transactions are not included.
    pub async fn executed(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }

    /// Connection id currently holding the lock, if any.
    pub async fn lock_owner(&self) -> Option<u64> {
        self.lock.lock().await.owner
    }

    /// Open a new pool against this server.
    pub fn open(self: &Arc<Self>) -> Arc<MemoryDatabase> {
        Arc::new(MemoryDatabase::new(Arc::clone(self)))
    }

    /// Register this server as driver `name`; each open creates a new pool.
    pub fn register(self: &Arc<Self>, registry: &mut DatabaseRegistry, name: &str) -> Result<()> {
        let server = Arc::clone(self);
        registry.register(name, move |_driver, _global, cancel: CancellationToken| {
            let server = Arc::clone(&server);
            async move {
                cancel::check(&cancel)?;
                Ok::<_, DbkitError>(server.open() as Arc<dyn Database>)
            }
        })
    }

    pub(crate) fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn check_statement(&self, sql: &str) -> Result<()> {
        let rejected = self.rejected.lock().await;
        if let Some(pattern) = rejected.iter().find(|p| sql.contains(p.as_str())) {
            return Err(DbkitError::Database(format!(
                "statement rejected (matches '{}'): {}",
                pattern, sql
            )));
        }
        Ok(())
    }

    pub(crate) async fn apply(&self, statements: impl IntoIterator<Item = String>) {
        self.executed.lock().await.extend(statements);
    }
}

#[derive(Debug, Default)]
pub(crate) struct PoolState {
    pub(crate) connections: usize,
    pub(crate) closed: bool,
}

pub(crate) struct PoolShared {
    pub(crate) server: Arc<MemoryServer>,
    pub(crate) state: Mutex<PoolState>,
}

/// A connection pool on a [`MemoryServer`].
pub struct MemoryDatabase {
    shared: Arc<PoolShared>,
}

impl MemoryDatabase {
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                server,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Number of connections not yet closed.
    pub async fn live_connections(&self) -> usize {
        self.shared.state.lock().await.connections
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn acquire_connection(&self, cancel: &CancellationToken) -> Result<Box<dyn Connection>> {
        cancel::check(cancel)?;
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(DbkitError::PoolClosed);
        }
        state.connections += 1;

        let id = self.shared.server.allocate_connection_id();
        debug!(connection_id = id, live = state.connections, "Memory connection acquired");
        Ok(Box::new(MemoryConnection::new(id, Arc::clone(&self.shared))))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.connections > 0 {
            return Err(DbkitError::PoolNotEmpty(state.connections));
        }
        state.closed = true;
        Ok(())
    }
}
