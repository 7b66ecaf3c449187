//! Per-key token-bucket rate limiter (spec §4.1).
//!
//! One bucket per key, refilled continuously at `rate` tokens/second up to
//! `burst`. A background sweeper evicts buckets idle longer than `ttl`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum RateLimiterError {
    #[error("refill rate must be positive, got {0}")]
    NonPositiveRate(f64),
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, rate: f64, burst: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }
}

struct Inner {
    rate: f64,
    burst: f64,
    ttl: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
    closed: AtomicBool,
}

/// Token-bucket rate limiter, safe under concurrent callers (spec §4.1).
pub struct RateLimiter {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// `rate` tokens/second, `burst` maximum bucket size. A `burst` of 0
    /// denies all requests; `rate <= 0.0` is a programming error.
    pub fn new(rate: f64, burst: u32) -> Result<Self, RateLimiterError> {
        Self::with_ttl(rate, burst, DEFAULT_TTL)
    }

    pub fn with_ttl(rate: f64, burst: u32, ttl: Duration) -> Result<Self, RateLimiterError> {
        if rate <= 0.0 {
            return Err(RateLimiterError::NonPositiveRate(rate));
        }

        let inner = Arc::new(Inner {
            rate,
            burst: burst as f64,
            ttl,
            buckets: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let sweep_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_inner.ttl);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if sweep_inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let now = Instant::now();
                let mut buckets = sweep_inner.buckets.lock().unwrap();
                let before = buckets.len();
                buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < sweep_inner.ttl);
                let evicted = before - buckets.len();
                if evicted > 0 {
                    debug!(evicted, "rate limiter sweeper evicted idle buckets");
                }
            }
        });

        Ok(Self {
            inner,
            sweeper: Mutex::new(Some(handle)),
        })
    }

    /// Consume one token for `key`. Unseen keys start at full burst.
    pub fn allow(&self, key: &str) -> bool {
        if self.inner.burst <= 0.0 {
            return false;
        }
        let now = Instant::now();
        let mut buckets = self.inner.buckets.lock().unwrap();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(self.inner.burst, now));
        bucket.refill(self.inner.rate, self.inner.burst, now);
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Stop the sweeper. Idempotent under concurrent callers: only the first
    /// caller actually aborts the task.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.inner.buckets.lock().unwrap().len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn rejects_non_positive_rate() {
        assert!(RateLimiter::new(0.0, 5).is_err());
        assert!(RateLimiter::new(-1.0, 5).is_err());
    }

    #[tokio::test]
    async fn burst_one_allows_one_then_denies() {
        let limiter = RateLimiter::new(1.0, 1).unwrap();
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        assert!(limiter.allow("other"));
    }

    #[tokio::test]
    async fn burst_zero_denies_everything() {
        let limiter = RateLimiter::new(1.0, 0).unwrap();
        assert!(!limiter.allow("k"));
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(100.0, 1).unwrap();
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.allow("k"));
    }

    #[tokio::test]
    async fn sweeper_evicts_idle_buckets() {
        let limiter = RateLimiter::with_ttl(1.0, 1, Duration::from_millis(30)).unwrap();
        limiter.allow("k");
        assert_eq!(limiter.bucket_count(), 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_under_concurrent_callers() {
        let limiter = Arc::new(RateLimiter::new(1.0, 1).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                limiter.close();
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }
}
