//! Bounded retry of version-checked writes.

use std::future::Future;

use tracing::debug;

use crate::error::ControllerResult;

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or `attempts` conflicts have been seen. `op` receives the zero-based
/// attempt number so it can reload state on retries.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> ControllerResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ControllerResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Err(e) if e.is_conflict() && attempt + 1 < attempts => {
                debug!(attempt, error = %e, "write conflict, retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}
