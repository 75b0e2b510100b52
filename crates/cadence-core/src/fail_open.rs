//! Fail-open utilities for graceful degradation
//!
//! Use these for infrastructure operations whose failure must not end a
//! session: metrics persistence and progress reporting.
//!
//! DO NOT use fail-open for:
//! - Session or checkpoint persistence (a lost record breaks resume)
//! - Adapter calls (failure handling belongs to fallback and recovery)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use cadence_core::fail_open::fail_open;
/// use cadence_core::Result;
///
/// async fn persist_metrics() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let stored = fail_open("metrics", || persist_metrics()).await;
///     // stored is None if persist_metrics() failed
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

/// Synchronous variant for callbacks
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
