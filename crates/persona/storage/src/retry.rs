//! Connection retry with exponential backoff.
//!
//! Containers start in arbitrary order, so the first connection attempts to a
//! database service routinely fail while it boots.

use crate::{StorageError, StorageResult};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Backoff schedule: attempt `n` waits `base * 2^(n + jitter)` with jitter in
/// `[0, 1)`, until the total budget would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            budget: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = f64::from(attempt) + jitter.clamp(0.0, 1.0);
        self.base_delay.mul_f64(2f64.powf(exponent))
    }
}

/// Run `connect` until it succeeds or the policy's budget runs out, in which
/// case the last error is surfaced.
pub async fn connect_with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut connect: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        let err = match connect().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let delay = policy.delay(attempt, rand::random::<f64>());
        if started.elapsed() + delay > policy.budget {
            return Err(StorageError::Connection(format!(
                "giving up after {} attempts: {err}",
                attempt + 1
            )));
        }
        warn!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "connection failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}
