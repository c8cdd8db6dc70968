//! Bounded exponential backoff for reconnects.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Zero is treated as a single attempt.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryExhausted<E: fmt::Display + fmt::Debug> {
    pub attempts: u32,
    pub last: E,
}

/// Runs `op` up to `policy.attempts()` times, sleeping the policy delay
/// after every failure, the last one included.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: ReconnectPolicy,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    E: fmt::Display + fmt::Debug,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "Attempt {}/{} failed: {}, waiting {:?}",
                    attempt, attempts, err, delay
                );
                tokio::time::sleep(delay).await;
                if attempt >= attempts {
                    return Err(RetryExhausted {
                        attempts,
                        last: err,
                    });
                }
                attempt += 1;
            }
        }
    }
}
