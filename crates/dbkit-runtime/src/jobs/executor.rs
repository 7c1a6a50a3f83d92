use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use dbkit_core::error::{DbkitError, Result};
use dbkit_core::fault;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Job, ReversibleJob};

/// Outcome of one job of an atomic set.
#[derive(Debug, Default)]
pub struct ReversibleJobResult {
    pub run_error: Option<DbkitError>,
    /// Only set when the job ran successfully and its rollback then failed.
    pub rollback_error: Option<DbkitError>,
}

impl ReversibleJobResult {
    pub fn is_ok(&self) -> bool {
        self.run_error.is_none() && self.rollback_error.is_none()
    }
}

/// At least one job of an atomic set failed; the jobs that had succeeded
/// were rolled back.
#[derive(Debug, Error)]
#[error("{}", summarize(.results))]
pub struct JobsFailed {
    pub results: Vec<ReversibleJobResult>,
}

fn summarize(results: &[ReversibleJobResult]) -> String {
    let failed = results.iter().filter(|r| r.run_error.is_some()).count();
    let mut message = format!("{} of {} job(s) failed", failed, results.len());
    for (index, result) in results.iter().enumerate() {
        if let Some(e) = &result.run_error {
            message.push_str(&format!("; job {}: {}", index, e));
        }
        if let Some(e) = &result.rollback_error {
            message.push_str(&format!("; rollback of job {} failed: {}", index, e));
        }
    }
    message
}

impl From<JobsFailed> for DbkitError {
    fn from(err: JobsFailed) -> Self {
        DbkitError::Job(err.to_string())
    }
}

/// Number of workers for `jobs` jobs. `0` requests one per available core.
pub fn worker_count(requested: usize, jobs: usize) -> usize {
    let workers = if requested == 0 {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    } else {
        requested
    };
    workers.min(jobs).max(1)
}

/// Run every job with at most `workers` in flight.
///
/// Results come back in submission order. A job that only gets its turn
/// after `cancel` fired is not started and yields `Cancelled`; jobs already
/// running see the token and decide for themselves.
pub async fn run_jobs<J>(
    cancel: &CancellationToken,
    jobs: &[Arc<J>],
    workers: usize,
) -> Vec<Result<()>>
where
    J: Job + ?Sized + 'static,
{
    let tasks: Vec<_> = jobs
        .iter()
        .map(|job| {
            let job = Arc::clone(job);
            move |cancel: CancellationToken| async move { job.run(&cancel).await }
        })
        .collect();
    execute(cancel, tasks, workers).await
}

/// Run every job; if any fails, roll back the ones that succeeded.
///
/// Primary actions run under a child of `run_cancel`. Rollbacks run under
/// `rollback_cancel`, which callers usually detach from `run_cancel` so a
/// cancelled invocation can still clean up after itself.
pub async fn run_jobs_atomically<J>(
    run_cancel: &CancellationToken,
    rollback_cancel: &CancellationToken,
    jobs: &[Arc<J>],
    workers: usize,
) -> std::result::Result<Vec<ReversibleJobResult>, JobsFailed>
where
    J: ReversibleJob + ?Sized + 'static,
{
    let run_token = run_cancel.child_token();
    let run_results = run_jobs(&run_token, jobs, workers).await;

    let mut results = Vec::with_capacity(run_results.len());
    let mut succeeded = Vec::new();
    for (index, result) in run_results.into_iter().enumerate() {
        let run_error = match result {
            Ok(()) => {
                succeeded.push(index);
                None
            }
            Err(e) => {
                warn!(index, error = %e, "Job failed");
                Some(e)
            }
        };
        results.push(ReversibleJobResult {
            run_error,
            rollback_error: None,
        });
    }

    if succeeded.len() == results.len() {
        return Ok(results);
    }

    debug!(count = succeeded.len(), "Rolling back succeeded jobs");
    let tasks: Vec<_> = succeeded
        .iter()
        .map(|&index| {
            let job = Arc::clone(&jobs[index]);
            move |cancel: CancellationToken| async move { job.rollback(&cancel).await }
        })
        .collect();
    let rollback_results = execute(rollback_cancel, tasks, workers).await;

    for (index, result) in succeeded.into_iter().zip(rollback_results) {
        if let Err(e) = result {
            warn!(index, error = %e, "Job rollback failed");
            results[index].rollback_error = Some(e);
        }
    }
    Err(JobsFailed { results })
}

async fn execute<F, Fut>(
    cancel: &CancellationToken,
    tasks: Vec<F>,
    workers: usize,
) -> Vec<Result<()>>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if tasks.is_empty() {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(worker_count(workers, tasks.len())));
    let handles: Vec<_> = tasks
        .into_iter()
        .enumerate()
        .map(|(index, task)| {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| DbkitError::Job("job executor shut down".to_string()))?;
                if cancel.is_cancelled() {
                    debug!(index, "Job skipped, cancelled before it started");
                    return Err(DbkitError::Cancelled);
                }
                fault::guard("running job", task(cancel)).await
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                Err(DbkitError::Panic(format!(
                    "job {} panicked: {}",
                    index,
                    fault::panic_message(payload.as_ref())
                )))
            }
            Err(e) => Err(DbkitError::Job(format!("job {} was aborted: {}", index, e))),
        };
        results.push(result);
    }
    results
}
