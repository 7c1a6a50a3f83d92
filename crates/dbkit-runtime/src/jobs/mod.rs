//! Bounded-concurrency job execution with all-or-nothing rollback.

mod executor;

pub use executor::{run_jobs, run_jobs_atomically, worker_count, JobsFailed, ReversibleJobResult};

use async_trait::async_trait;
use dbkit_core::error::Result;
use tokio_util::sync::CancellationToken;

/// A unit of work.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, cancel: &CancellationToken) -> Result<()>;
}

/// A unit of work with a compensating action.
#[async_trait]
pub trait ReversibleJob: Job {
    /// Undo a successful [`Job::run`].
    async fn rollback(&self, cancel: &CancellationToken) -> Result<()>;
}
