//! Exponential backoff for transient failures.
//!
//! Wraps an async operation and re-runs it while a caller-supplied
//! classifier says the failure is worth another try. `max_retries` bounds
//! the retries after the first attempt, so `max_retries + 1` attempts run
//! in total.

use crate::config::RetryParams;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay before the retry following `attempt` (zero-based): the base delay
/// doubled per attempt, capped at `max_delay`.
pub fn backoff_delay(params: &RetryParams, attempt: u32) -> Duration {
    params
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(params.max_delay)
}

/// Runs `operation` until it succeeds, the classifier rejects the error, or
/// the retry budget is spent. The operation receives the zero-based attempt
/// number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    params: &RetryParams,
    mut operation: F,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= params.max_retries || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = backoff_delay(params, attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = params.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying: {err}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
