//! Migration pairing, pending-set computation and the run engine.

mod jobs;
mod runner;
mod source;
mod source_store;

pub use runner::{MigrationReport, MigrationRunner};
pub use source::{compute_checksum, MigrationContents, MigrationSource};
pub use source_store::{MigrationSourceStore, MigrationStatus};

use std::fmt;

/// Which way a run moves the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}
