use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::key_generator::KeyGenerator;
use crate::metrics::MetricsRegistry;
use crate::store::{BucketLimits, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSettings {
    pub capacity: u32,
    pub refill_rate: f64,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub default_wait: Duration,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            capacity: 50,
            refill_rate: 50.0,
            poll_interval: Duration::from_millis(100),
            default_wait: Duration::from_millis(5000),
        }
    }
}

/// Global token bucket shared by every worker in every process that points
/// at the same store.
#[derive(Clone)]
pub struct AtomicRateLimiter {
    store: Arc<dyn TokenStore>,
    key: String,
    limits: BucketLimits,
    poll_interval: Duration,
    default_wait: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl AtomicRateLimiter {
    pub fn new(
        store: Arc<dyn TokenStore>,
        keys: &KeyGenerator,
        settings: RateLimiterSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            key: keys.bucket_key("global"),
            limits: BucketLimits {
                capacity: settings.capacity,
                refill_rate: settings.refill_rate,
            },
            poll_interval: settings.poll_interval,
            default_wait: settings.default_wait,
            metrics,
        }
    }

    /// Refill and take one token in a single store operation. Never blocks.
    pub async fn try_acquire(&self) -> Result<bool> {
        let reading = self.store.try_consume(&self.key, self.limits, 1).await?;
        self.metrics.set_token_bucket_current(reading.remaining);

        if !reading.acquired {
            self.metrics.record_token_bucket_exhausted();
            tracing::trace!(bucket = %self.key, remaining = reading.remaining, "Token bucket exhausted");
        }
        Ok(reading.acquired)
    }

    /// Poll `try_acquire` until a token is granted or `max_wait` elapses.
    /// Returns false on timeout without having consumed anything.
    pub async fn acquire_with_wait(&self, max_wait: Duration) -> Result<bool> {
        if self.try_acquire().await? {
            return Ok(true);
        }

        self.metrics.record_token_bucket_wait();
        let deadline = Instant::now() + max_wait;

        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    bucket = %self.key,
                    waited_ms = max_wait.as_millis() as u64,
                    "Gave up waiting for a token"
                );
                return Ok(false);
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;

            if self.try_acquire().await? {
                return Ok(true);
            }
        }
    }

    /// `acquire_with_wait` with the configured default timeout
    pub async fn acquire(&self) -> Result<bool> {
        self.acquire_with_wait(self.default_wait).await
    }

    pub async fn available(&self) -> Result<f64> {
        let tokens = self.store.peek(&self.key, self.limits).await?;
        self.metrics.set_token_bucket_current(tokens);
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTokenStore;

    fn limiter(capacity: u32, refill_rate: f64) -> (AtomicRateLimiter, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let limiter = AtomicRateLimiter::new(
            Arc::new(MemoryTokenStore::new()),
            &KeyGenerator::default(),
            RateLimiterSettings {
                capacity,
                refill_rate,
                ..RateLimiterSettings::default()
            },
            metrics.clone(),
        );
        (limiter, metrics)
    }

    #[tokio::test]
    async fn test_three_concurrent_acquires_against_capacity_two() {
        let (limiter, metrics) = limiter(2, 1.0);

        let (a, b, c) = tokio::join!(
            limiter.try_acquire(),
            limiter.try_acquire(),
            limiter.try_acquire()
        );
        let granted = [a.unwrap(), b.unwrap(), c.unwrap()]
            .iter()
            .filter(|ok| **ok)
            .count();

        assert_eq!(granted, 2);
        assert_eq!(metrics.token_bucket_exhausted(), 1);
    }

    #[tokio::test]
    async fn test_acquire_with_wait_times_out_in_window() {
        let (limiter, metrics) = limiter(1, 1.0);
        assert!(limiter.try_acquire().await.unwrap());

        let started = std::time::Instant::now();
        let acquired = limiter
            .acquire_with_wait(Duration::from_millis(200))
            .await
            .unwrap();
        let waited = started.elapsed();

        assert!(!acquired);
        assert!(waited >= Duration::from_millis(200), "returned after {waited:?}");
        assert!(waited < Duration::from_millis(300), "returned after {waited:?}");
        assert_eq!(metrics.token_bucket_waits(), 1);
    }

    #[tokio::test]
    async fn test_acquire_with_wait_succeeds_after_refill() {
        let (limiter, _) = limiter(1, 10.0);
        assert!(limiter.try_acquire().await.unwrap());

        // one token every 100ms
        assert!(limiter
            .acquire_with_wait(Duration::from_millis(500))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_available_updates_gauge() {
        let (limiter, metrics) = limiter(5, 0.001);
        assert!(limiter.try_acquire().await.unwrap());
        let tokens = limiter.available().await.unwrap();
        assert!(tokens >= 4.0 && tokens < 4.1);
        assert_eq!(metrics.token_bucket_current(), tokens);
    }

    #[tokio::test]
    async fn test_grants_bounded_by_capacity_plus_refill_over_time() {
        let (limiter, _) = limiter(5, 20.0);
        let started = std::time::Instant::now();
        let mut granted = 0u32;

        while started.elapsed() < Duration::from_millis(300) {
            if limiter.try_acquire().await.unwrap() {
                granted += 1;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let ceiling = 5 + (started.elapsed().as_secs_f64() * 20.0).floor() as u32;
        assert!(granted <= ceiling, "{granted} grants, ceiling {ceiling}");
        assert!(granted >= 8, "refill never kicked in: {granted} grants");
    }

    #[tokio::test]
    async fn test_acquire_waits_with_default_budget() {
        let (limiter, metrics) = limiter(1, 20.0);
        assert!(limiter.acquire().await.unwrap());
        assert!(limiter.acquire().await.unwrap());
        assert_eq!(metrics.token_bucket_waits(), 1);
    }
}
