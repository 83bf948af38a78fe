use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{ShoalError, ShoalResult};

/// Retry strategy configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Base delay before the first retry
    pub base_delay: Duration,
    /// Ceiling for the exponential delay
    pub max_delay: Duration,
    /// Uniform jitter added on top, as a fraction of the delay (0..=1)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Clamp out-of-range values back to the defaults
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_retries < 1 {
            self.max_retries = defaults.max_retries;
        }
        if self.base_delay.is_zero() {
            self.base_delay = defaults.base_delay;
        }
        if self.max_delay.is_zero() {
            self.max_delay = defaults.max_delay;
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            self.jitter_factor = defaults.jitter_factor;
        }
        self
    }
}

/// Exponential backoff with jitter.
///
/// Delay for attempt `k` (0-based) is `min(base · 2^k, max)` plus a uniform
/// jitter drawn from `[0, delay · jitter_factor]`.
#[derive(Debug, Clone)]
pub struct ExponentialRetry {
    config: RetryConfig,
}

impl ExponentialRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: config.sanitized(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Execute `op` until it succeeds or the retry budget runs out.
    ///
    /// Non-retryable errors abort immediately; otherwise the last error is
    /// folded into `ShoalError::RetryExhausted` after `max_retries + 1`
    /// attempts.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> ShoalResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ShoalResult<T>>,
    {
        let attempts = self.config.max_retries + 1;
        let mut last_error: Option<ShoalError> = None;

        for attempt in 0..attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        warn!(error = %err, "Operation failed with non-retryable error");
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }

            if attempt + 1 == attempts {
                break;
            }

            let delay = self.delay_for(attempt);
            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "Attempt failed, backing off"
            );
            sleep(delay).await;
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt recorded".to_string());
        Err(ShoalError::retry_exhausted(attempts, message))
    }

    /// Backoff with jitter for the given 0-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        let jitter_span = base.as_secs_f64() * self.config.jitter_factor;
        let jitter = if jitter_span > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(0.0..=jitter_span)
        } else {
            0.0
        };
        base + Duration::from_secs_f64(jitter)
    }

    /// Backoff without jitter: `min(base · 2^attempt, max)`
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let shifted = self
            .config
            .base_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.config.max_delay);
        shifted.min(self.config.max_delay)
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_retry(max_retries: u32) -> ExponentialRetry {
        ExponentialRetry::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            jitter_factor: 0.0,
        })
    }

    async fn fail_k_times(
        retry: &ExponentialRetry,
        k: usize,
        counter: Arc<AtomicUsize>,
    ) -> ShoalResult<u32> {
        retry
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let calls = counter.fetch_add(1, Ordering::SeqCst);
                    if calls < k {
                        Err(ShoalError::network("temporary failure"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let counter = Arc::new(AtomicUsize::new(0));
            let result = fail_k_times(&fast_retry(3), 0, Arc::clone(&counter)).await;
            assert_eq!(result.unwrap(), 42);
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        })
        .await
        .expect("test_success_on_first_attempt timed out");
    }

    #[tokio::test]
    async fn test_success_iff_failures_within_budget() {
        tokio::time::timeout(Duration::from_secs(5), async {
            // k == max_retries: succeeds on the final attempt.
            let counter = Arc::new(AtomicUsize::new(0));
            let result = fail_k_times(&fast_retry(3), 3, Arc::clone(&counter)).await;
            assert_eq!(result.unwrap(), 42);
            assert_eq!(counter.load(Ordering::SeqCst), 4);

            // k == max_retries + 1: budget exhausted.
            let counter = Arc::new(AtomicUsize::new(0));
            let result = fail_k_times(&fast_retry(3), 4, Arc::clone(&counter)).await;
            assert!(matches!(result, Err(ShoalError::RetryExhausted { attempts: 4, .. })));
            assert_eq!(counter.load(Ordering::SeqCst), 4);
        })
        .await
        .expect("test_success_iff_failures_within_budget timed out");
    }

    #[tokio::test]
    async fn test_non_retryable_aborts() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let counter = Arc::new(AtomicUsize::new(0));
            let retry = fast_retry(3);
            let result: ShoalResult<u32> = retry
                .run(|| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(ShoalError::config("invalid"))
                    }
                })
                .await;
            assert!(matches!(result, Err(ShoalError::ConfigInvalid { .. })));
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        })
        .await
        .expect("test_non_retryable_aborts timed out");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = ExponentialRetry::new(RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            jitter_factor: 0.0,
        });

        assert_eq!(retry.base_delay_for(0), Duration::from_millis(200));
        assert_eq!(retry.base_delay_for(1), Duration::from_millis(400));
        assert_eq!(retry.base_delay_for(2), Duration::from_millis(800));
        assert_eq!(retry.base_delay_for(3), Duration::from_millis(1600));
        assert_eq!(retry.base_delay_for(4), Duration::from_secs(3));
        assert_eq!(retry.base_delay_for(30), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_bounds() {
        let retry = ExponentialRetry::new(RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_factor: 0.2,
        });

        for _ in 0..50 {
            let delay = retry.delay_for(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_config_sanitization() {
        let retry = ExponentialRetry::new(RetryConfig {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 3.0,
        });
        assert_eq!(retry.max_retries(), 3);
        assert_eq!(retry.base_delay_for(0), Duration::from_millis(200));
    }
}
