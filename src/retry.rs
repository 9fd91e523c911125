//! Bounded retry with exponential backoff, shared by every upstream adapter.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::config::{RETRY_BASE_DELAY_MS, RETRY_MAX_ATTEMPTS};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay }
    }

    /// Delay after the failed attempt `attempt` (0-based): `base × 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached. Errors
/// rejected by `should_retry` propagate at once.
pub async fn with_retry_when<T, E, F, Fut, P>(
    policy: RetryPolicy,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt + 1 >= attempts || !should_retry(&e) {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "retrying after error: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
