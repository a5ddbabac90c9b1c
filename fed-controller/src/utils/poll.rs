use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::time::Instant;
use tracing::trace;

/// Outcome of one polling step.
pub enum Poll<T> {
    Done(T),
    Retry,
}

/// Runs `step` immediately and then every `interval` until it returns
/// [`Poll::Done`], fails, or `timeout` has elapsed.
///
/// An `Err` from `step` is permanent and returned as is; transient failures
/// are expected to be reported as [`Poll::Retry`].
pub async fn poll_until<T, F, Fut>(interval: Duration, timeout: Duration, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Poll::Done(value) = step().await? {
            return Ok(value);
        }
        let next = Instant::now() + interval;
        if next > deadline {
            return Err(anyhow!(
                "timed out after {attempt} attempts ({}ms)",
                timeout.as_millis()
            ));
        }
        trace!("poll attempt {attempt} not done, retrying");
        tokio::time::sleep_until(next).await;
    }
}
