//! Fault boundary for driver and job calls.
//!
//! A panic inside a guarded future is caught and turned into
//! [`DbkitError::Panic`] so the caller only ever sees a normal error.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::error;

use crate::error::{DbkitError, Result};

/// Run `fut`, converting a panic into an error for `operation`.
pub async fn guard<T, F>(operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(operation, panic = %message, "Recovered from panic");
            Err(DbkitError::Panic(format!(
                "panic while {}: {}",
                operation, message
            )))
        }
    }
}

/// Best-effort extraction of a panic payload's message.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
