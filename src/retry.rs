//! Exponential backoff for search execution.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1),
        }
    }

    /// Delay after failed attempt `attempt` (0-based):
    /// `min(base * multiplier^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds or retries are exhausted, returning
    /// the last error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        what,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retry attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[test]
    fn delays_double_up_to_the_ceiling() {
        let p = RetryPolicy::default();
        let delays: Vec<u64> = (0..6).map(|a| p.delay_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000, 10000]);
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(200), Duration::from_millis(10000));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_four_times() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let stamps = Mutex::new(Vec::new());

        let result: Result<()> = policy
            .run("test", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                stamps.lock().unwrap().push(Instant::now());
                async { anyhow::bail!("boom") }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let stamps = stamps.into_inner().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 3);
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
        assert!(gaps[0] >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let value = policy
            .run("test", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        anyhow::bail!("transient")
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }
}
