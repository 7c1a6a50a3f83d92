//! Driver implementations and the migration and seed engines.

pub mod db;
pub mod drivers;
pub mod jobs;
pub mod migrations;
pub mod seeds;
pub mod source;

mod session;

pub use migrations::{Direction, MigrationReport, MigrationRunner, MigrationStatus};
pub use seeds::SeedRunner;
