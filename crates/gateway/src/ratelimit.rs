//! Token-bucket rate limiting, global and per-principal, plus a semaphore
//! based concurrency limiter. Infrastructure endpoints (`/health`, `/ready`,
//! `/metrics`) are exempt from both so liveness probes never starve under
//! load.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Semaphore, SemaphorePermit};

const INFRA_PATHS: &[&str] = &["/health", "/ready", "/metrics"];

pub fn is_infra_endpoint(path: &str) -> bool {
    INFRA_PATHS.contains(&path)
}

/// Classic token bucket: capacity `burst`, refilled at `rate` tokens/sec.
/// `last_access` is advanced lazily on each `try_acquire` call rather than by
/// a background tick, so idle buckets cost nothing until touched again.
pub(crate) struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: Mutex<f64>,
    last_access: Mutex<Instant>,
}

/// Polling cadence for `acquire`'s wait loop. Coarse enough to avoid busy
/// spinning, fine enough that a caller is rarely delayed far past the
/// moment a token actually becomes available.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(25);

impl TokenBucket {
    pub(crate) fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            tokens: Mutex::new(burst),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_access.lock().unwrap();
        let elapsed = now.duration_since(*last).as_secs_f64();
        *last = now;

        let mut tokens = self.tokens.lock().unwrap();
        *tokens = (*tokens + elapsed * self.rate).min(self.burst);
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits until a token is available, polling at a fixed interval. Used
    /// ahead of an outbound identity-provider call so a burst of validations
    /// is smoothed out instead of hammering GitHub's API.
    pub(crate) async fn acquire(&self) {
        while !self.try_acquire() {
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().unwrap().elapsed()
    }
}

pub struct RateLimiterConfig {
    pub global_rate: f64,
    pub global_burst: f64,
    pub per_user_rate: f64,
    pub per_user_burst: f64,
    /// Buckets idle longer than this are reclaimed by `sweep_idle`.
    pub idle_eviction: Duration,
}

pub struct RateLimiter {
    global: TokenBucket,
    per_user: DashMap<String, TokenBucket>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let global = TokenBucket::new(config.global_rate, config.global_burst);
        Self { global, per_user: DashMap::new(), config }
    }

    /// Returns `Ok(())` if both the global and the per-user bucket admit the
    /// request, `Err(true)` if the global bucket was the one that rejected
    /// it (so callers can distinguish `GLOBAL_RATE_LIMIT_EXCEEDED` from
    /// `PER_USER_RATE_LIMIT_EXCEEDED`).
    pub fn check(&self, principal: &str) -> Result<(), bool> {
        if !self.global.try_acquire() {
            return Err(true);
        }
        let bucket = self
            .per_user
            .entry(principal.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.per_user_rate, self.config.per_user_burst));
        if !bucket.try_acquire() {
            return Err(false);
        }
        Ok(())
    }

    /// Drops per-user buckets that have not been touched recently, bounding
    /// memory for a gateway with high principal churn.
    pub fn sweep_idle(&self) {
        let threshold = self.config.idle_eviction;
        self.per_user.retain(|_, bucket| bucket.idle_for() < threshold);
    }

    pub fn tracked_users(&self) -> usize {
        self.per_user.len()
    }
}

/// Bounds in-flight request concurrency. Exceeding the limit returns
/// `None` immediately rather than queuing, since a queued proxy request
/// just relocates backpressure instead of relieving it.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicI64>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                self.in_flight.fetch_add(1, Ordering::Relaxed);
                Some(permit)
            },
            Err(_) => None,
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infra_paths_are_exempt() {
        assert!(is_infra_endpoint("/health"));
        assert!(is_infra_endpoint("/ready"));
        assert!(is_infra_endpoint("/metrics"));
        assert!(!is_infra_endpoint("/v2/"));
    }

    #[test]
    fn bucket_allows_up_to_burst_then_rejects() {
        let bucket = TokenBucket::new(1.0, 3.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn limiter_distinguishes_global_from_per_user() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            global_rate: 0.0,
            global_burst: 1.0,
            per_user_rate: 0.0,
            per_user_burst: 5.0,
            idle_eviction: Duration::from_secs(60),
        });
        assert!(limiter.check("alice").is_ok());
        // global bucket now exhausted regardless of per-user headroom
        assert_eq!(limiter.check("alice"), Err(true));
    }

    #[test]
    fn per_user_buckets_are_independent() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            global_rate: 0.0,
            global_burst: 100.0,
            per_user_rate: 0.0,
            per_user_burst: 1.0,
            idle_eviction: Duration::from_secs(60),
        });
        assert!(limiter.check("alice").is_ok());
        assert_eq!(limiter.check("alice"), Err(false));
        assert!(limiter.check("bob").is_ok());
    }

    #[test]
    fn concurrency_limiter_rejects_past_capacity() {
        let limiter = ConcurrencyLimiter::new(1);
        let first = limiter.try_acquire();
        assert!(first.is_some());
        assert!(limiter.try_acquire().is_none());
        drop(first);
        assert!(limiter.try_acquire().is_some());
    }
}
