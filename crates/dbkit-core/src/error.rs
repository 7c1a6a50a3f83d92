use thiserror::Error;

/// Core error type for dbkit operations.
#[derive(Error, Debug)]
pub enum DbkitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown {kind} driver: {name}")]
    UnknownDriver { kind: &'static str, name: String },

    #[error("{kind} driver already registered: {name}")]
    DriverAlreadyRegistered { kind: &'static str, name: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection pool is not empty: {0} connection(s) still open")]
    PoolNotEmpty(usize),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Lock already held: another migration process is already running")]
    LockHeld,

    #[error("Lock is not held by this connection")]
    LockNotHeld,

    #[error("A transaction is already in progress")]
    TransactionInProgress,

    #[error("No transaction in progress")]
    NoTransaction,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Source error: {0}")]
    Source(String),

    /// Sources disagree with each other or with the applied history.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The applied history holds a crashed up or down migration.
    #[error("Corrupted db state: {0}")]
    CorruptedState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Panic: {0}")]
    Panic(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<DbkitError>,
    },
}

impl DbkitError {
    /// Wrap this error with the operation it occurred in.
    pub fn context(self, context: impl Into<String>) -> Self {
        DbkitError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error beneath any context wrapping.
    pub fn root(&self) -> &DbkitError {
        let mut err = self;
        while let DbkitError::Context { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), DbkitError::Cancelled)
    }

    /// Lock, transaction and pool contention. Never retried automatically.
    pub fn is_contention(&self) -> bool {
        matches!(
            self.root(),
            DbkitError::LockHeld | DbkitError::TransactionInProgress | DbkitError::PoolNotEmpty(_)
        )
    }

    /// Integrity failures require manual operator correction.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self.root(),
            DbkitError::Integrity(_) | DbkitError::CorruptedState(_)
        )
    }
}

/// Attach context to fallible results.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<DbkitError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

/// Result type alias using DbkitError.
pub type Result<T> = std::result::Result<T, DbkitError>;
