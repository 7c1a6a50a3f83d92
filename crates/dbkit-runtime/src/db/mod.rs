//! Database backends.

pub mod memory;
pub mod pg;

pub use memory::{MemoryDatabase, MemoryServer};
pub use pg::{PgConfig, PostgresDatabase};
