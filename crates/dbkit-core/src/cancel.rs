//! Cancellation helpers built on [`CancellationToken`].
//!
//! Every driver operation takes a token. An already-cancelled token makes the
//! operation fail before it has any side effect; a token that fires while the
//! operation is pending aborts it.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DbkitError, Result};

/// Fail fast when the token has already fired.
pub fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(DbkitError::Cancelled);
    }
    Ok(())
}

/// Drive `fut` to completion unless the token fires first.
pub async fn run_until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    check(cancel)?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DbkitError::Cancelled),
        result = fut => result,
    }
}

/// A child of `parent` that also fires once `timeout` elapses.
pub fn deadline(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    spawn_timer(token.clone(), timeout);
    token
}

/// A token detached from any caller cancellation that fires after `timeout`.
///
/// Used for compensating actions which must still get a chance to run after
/// the invocation's own deadline has passed.
pub fn detached_deadline(timeout: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    spawn_timer(token.clone(), timeout);
    token
}

fn spawn_timer(token: CancellationToken, timeout: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                debug!(?timeout, "Deadline elapsed");
                token.cancel();
            }
        }
    });
}
