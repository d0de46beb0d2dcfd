//! Bounded retry for rate-limited provider calls.

use std::future::Future;
use std::time::Duration;

use crate::error::LlmError;

/// Retry policy applied to rate-limit errors only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Wait used when the provider doesn't suggest one.
    pub fallback_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            fallback_delay: Duration::from_secs(40),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying after a rate limit up to `max_retries` times.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(LlmError::RateLimited {
                    provider,
                    retry_after,
                }) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = retry_after.unwrap_or(self.fallback_delay);
                    tracing::warn!(
                        provider = %provider,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        "Rate limited, waiting before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
