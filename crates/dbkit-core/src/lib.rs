//! Core types for dbkit: errors, configuration, driver contracts, sources
//! and driver registries.

pub mod cancel;
pub mod config;
pub mod driver;
pub mod error;
pub mod fault;
pub mod registry;
pub mod source;

pub use config::{DbkitConfig, DriverConfig, GlobalConfig};
pub use driver::{
    AppliedMigration, AppliedMigrationStore, Connection, Database, Lock, Transaction,
    MIGRATION_LOCK_ID,
};
pub use error::{DbkitError, Result, ResultExt};
pub use registry::{DatabaseRegistry, DriverRegistry, SourceRegistry};
pub use source::{Source, SourceContents, Store};

pub use tokio_util::sync::CancellationToken;
