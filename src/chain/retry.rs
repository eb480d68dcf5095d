use crate::error::SourceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Timeout and retry budget for a single remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, max_ms: u64, retries: u32) -> Self {
        Self {
            initial_delay_ms: initial_ms,
            max_delay_ms: max_ms,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.initial_backoff_ms, policy.max_backoff_ms, policy.max_retries)
    }

    /// Delay before the next attempt, without jitter
    pub fn next_delay_ms(&self) -> u64 {
        let factor = 2_u64.saturating_pow(self.current_attempt);
        std::cmp::min(self.initial_delay_ms.saturating_mul(factor), self.max_delay_ms)
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        // Up to 25% jitter
        let base = self.next_delay_ms();
        let jitter = if base >= 4 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        let delay = base + jitter;

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay
        );

        sleep(Duration::from_millis(delay)).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Run `op` with a per-attempt timeout, retrying retryable failures with backoff
///
/// Non-retryable errors return immediately. Once retries are exhausted the
/// last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut backoff = ExponentialBackoff::from_policy(policy);

    loop {
        let outcome = match timeout(Duration::from_millis(policy.timeout_ms), op()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(policy.timeout_ms)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                log::warn!("⚠️  {} failed: {}", label, err);
                if backoff.sleep().await.is_err() {
                    log::error!("❌ {} gave up after {} retries", label, backoff.attempts());
                    return Err(err);
                }
            }
            Err(err) => {
                log::error!("❌ {} failed (not retryable): {}", label, err);
                return Err(err);
            }
        }
    }
}
