//! Fail-open helpers for side effects that must never abort a task
//!
//! Use these for the activity log and similar bookkeeping. Remote commands,
//! model calls and tool dispatch report their own errors and must not be
//! wrapped here.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an operation, logging and swallowing its error.
///
/// Returns `None` when the operation failed.
///
/// ```no_run
/// use sandbox_core::fail_open::fail_open;
/// use sandbox_core::Result;
///
/// async fn append_log() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("activity_log", || append_log()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Synchronous variant for non-async bookkeeping
pub fn fail_open_sync<F, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Result<T>,
{
    match f() {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
