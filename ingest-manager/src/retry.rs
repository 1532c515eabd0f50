//! Fixed-delay retry mechanics.
//!
//! This module only re-runs operations; it knows nothing about why they
//! failed. Classifying an upstream error and picking the matching budget is
//! the provider client's job (see [`crate::failure`]).

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// A retry budget: how many times to re-run a failed operation, and the
/// fixed pause between attempts. The delay is constant, not exponential.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            delay: Duration::from_millis(delay_ms),
        }
    }
}

/// Runs `op`, retrying on failure up to `policy.max_retries` times with a
/// fixed delay between attempts.
///
/// The operation runs exactly `max_retries + 1` times in the worst case; the
/// last error is returned once the budget is exhausted.
pub async fn retry_with_policy<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                attempt += 1;
                debug!(attempt, max_retries = policy.max_retries, "Retrying after failure");
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
