//! Cache-backed rate limiter with sliding-window and fixed-window variants.
//!
//! Both variants fail open: when the cache errors the request is allowed and
//! the decision is marked `degraded`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use taskflow_cache::{CacheBackend, CacheResult};
pub use taskflow_core::config::RateLimitAlgorithm;
use taskflow_core::types::PlanTier;
use taskflow_core::Clock;
use tracing::{debug, warn};
use uuid::Uuid;

/// `limit` requests per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub limit: u64,
    pub window_secs: u64,
}

impl RateLimitPolicy {
    pub const fn new(limit: u64, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }
}

const HOUR: u64 = 3600;
const DAY: u64 = 86_400;

/// Chat endpoint limits per organization.
pub fn chat_policy(plan: PlanTier) -> RateLimitPolicy {
    match plan {
        PlanTier::Free => RateLimitPolicy::new(10, HOUR),
        PlanTier::Pro => RateLimitPolicy::new(100, HOUR),
        PlanTier::Enterprise => RateLimitPolicy::new(1_000, HOUR),
    }
}

/// Generic API limits per organization.
pub fn api_policy(plan: PlanTier) -> RateLimitPolicy {
    match plan {
        PlanTier::Free => RateLimitPolicy::new(100, DAY),
        PlanTier::Pro => RateLimitPolicy::new(10_000, DAY),
        PlanTier::Enterprise => RateLimitPolicy::new(100_000, DAY),
    }
}

/// Result returned by [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Seconds until a retry can succeed; set only on rejection.
    pub retry_after_secs: Option<u64>,
    /// The cache failed and the request was let through unchecked.
    pub degraded: bool,
}

pub struct RateLimiter {
    cache: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    prefix: String,
    algorithm: RateLimitAlgorithm,
}

impl RateLimiter {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
        algorithm: RateLimitAlgorithm,
    ) -> Self {
        Self {
            cache,
            clock,
            prefix: prefix.into(),
            algorithm,
        }
    }

    pub fn algorithm(&self) -> RateLimitAlgorithm {
        self.algorithm
    }

    /// Check and consume one request for `caller_key`.
    pub async fn check(&self, caller_key: &str, policy: RateLimitPolicy) -> RateLimitDecision {
        let key = format!("{}:{}", self.prefix, caller_key);
        let now = self.clock.now();
        let result = match self.algorithm {
            RateLimitAlgorithm::SlidingWindow => self.sliding_window(&key, policy, now).await,
            RateLimitAlgorithm::FixedWindow => self.fixed_window(&key, policy, now).await,
        };

        match result {
            Ok(decision) => {
                debug!(
                    key = %key,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "Rate limit checked"
                );
                decision
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limiter cache failed; allowing request");
                metrics::counter!("rate_limit.degraded").increment(1);
                RateLimitDecision {
                    allowed: true,
                    limit: policy.limit,
                    remaining: policy.limit,
                    reset_at: now + window(policy),
                    retry_after_secs: None,
                    degraded: true,
                }
            }
        }
    }

    async fn fixed_window(
        &self,
        key: &str,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> CacheResult<RateLimitDecision> {
        let count = self.cache.incr(key).await?.max(0) as u64;
        if count == 1 {
            self.cache.expire(key, policy.window_secs).await?;
        }

        let mut ttl = self.cache.ttl(key).await?;
        if ttl < 0 {
            // Counter without an expiry (lost EXPIRE); restart its window.
            self.cache.expire(key, policy.window_secs).await?;
            ttl = policy.window_secs as i64;
        }
        let ttl = (ttl as u64).min(policy.window_secs);
        let reset_at = now + Duration::seconds(ttl as i64);

        if count > policy.limit {
            return Ok(RateLimitDecision {
                allowed: false,
                limit: policy.limit,
                remaining: 0,
                reset_at,
                retry_after_secs: Some(ttl),
                degraded: false,
            });
        }
        Ok(RateLimitDecision {
            allowed: true,
            limit: policy.limit,
            remaining: policy.limit - count,
            reset_at,
            retry_after_secs: None,
            degraded: false,
        })
    }

    async fn sliding_window(
        &self,
        key: &str,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> CacheResult<RateLimitDecision> {
        let now_ms = now.timestamp_millis();
        let window_ms = (policy.window_secs as i64) * 1000;

        self.cache
            .zrem_range_by_score(key, i64::MIN, now_ms - window_ms)
            .await?;
        let count = self.cache.zcard(key).await?;

        if count >= policy.limit {
            let oldest = self.cache.zoldest(key).await?.unwrap_or(now_ms);
            let free_at = oldest + window_ms;
            let wait_ms = (free_at - now_ms).max(0);
            let retry_after = ((wait_ms + 999) / 1000).max(1) as u64;
            return Ok(RateLimitDecision {
                allowed: false,
                limit: policy.limit,
                remaining: 0,
                reset_at: now + Duration::milliseconds(wait_ms),
                retry_after_secs: Some(retry_after.min(policy.window_secs.max(1))),
                degraded: false,
            });
        }

        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
        self.cache.zadd(key, now_ms, &member).await?;
        self.cache.expire(key, policy.window_secs).await?;

        Ok(RateLimitDecision {
            allowed: true,
            limit: policy.limit,
            remaining: policy.limit - count - 1,
            reset_at: now + window(policy),
            retry_after_secs: None,
            degraded: false,
        })
    }
}

fn window(policy: RateLimitPolicy) -> Duration {
    Duration::seconds(policy.window_secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use taskflow_cache::{CacheError, LocalCache};
    use taskflow_core::ManualClock;

    fn limiter(algorithm: RateLimitAlgorithm) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap(),
        ));
        let cache = Arc::new(LocalCache::new(clock.clone()));
        (clock.clone(), RateLimiter::new(cache, clock, "ratelimit:test", algorithm))
    }

    #[tokio::test]
    async fn test_fixed_window_limit() {
        let (_clock, limiter) = limiter(RateLimitAlgorithm::FixedWindow);
        let policy = RateLimitPolicy::new(5, 60);

        for i in 0..5 {
            let d = limiter.check("org:1", policy).await;
            assert!(d.allowed, "request {i} should be allowed");
            assert_eq!(d.remaining, 4 - i);
        }

        let d = limiter.check("org:1", policy).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        let retry = d.retry_after_secs.unwrap();
        assert!(retry <= 60, "retry_after {retry} exceeds window");

        // Other keys are independent.
        assert!(limiter.check("org:2", policy).await.allowed);
    }

    #[tokio::test]
    async fn test_fixed_window_resets() {
        let (clock, limiter) = limiter(RateLimitAlgorithm::FixedWindow);
        let policy = chat_policy(PlanTier::Free);

        for _ in 0..10 {
            assert!(limiter.check("org:1", policy).await.allowed);
        }
        assert!(!limiter.check("org:1", policy).await.allowed);

        clock.advance(Duration::seconds(HOUR as i64));
        let d = limiter.check("org:1", policy).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, policy.limit - 1);
    }

    #[tokio::test]
    async fn test_sliding_window() {
        let (clock, limiter) = limiter(RateLimitAlgorithm::SlidingWindow);
        let policy = RateLimitPolicy::new(3, 60);

        for _ in 0..3 {
            assert!(limiter.check("user:1", policy).await.allowed);
            clock.advance(Duration::seconds(10));
        }
        // t=30s: three requests at 0s, 10s, 20s.
        let d = limiter.check("user:1", policy).await;
        assert!(!d.allowed);
        assert_eq!(d.retry_after_secs, Some(30));

        // t=61s: the first request has left the window.
        clock.advance(Duration::seconds(31));
        let d = limiter.check("user:1", policy).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    struct BrokenCache;

    #[async_trait]
    impl CacheBackend for BrokenCache {
        async fn incr(&self, _: &str) -> CacheResult<i64> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn expire(&self, _: &str, _: u64) -> CacheResult<()> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn ttl(&self, _: &str) -> CacheResult<i64> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn zadd(&self, _: &str, _: i64, _: &str) -> CacheResult<()> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn zrem_range_by_score(&self, _: &str, _: i64, _: i64) -> CacheResult<u64> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn zcard(&self, _: &str) -> CacheResult<u64> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn zoldest(&self, _: &str) -> CacheResult<Option<i64>> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn ping(&self) -> CacheResult<()> {
            Err(CacheError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_fails_open() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        for algorithm in [RateLimitAlgorithm::FixedWindow, RateLimitAlgorithm::SlidingWindow] {
            let limiter = RateLimiter::new(Arc::new(BrokenCache), clock.clone(), "rl", algorithm);
            assert_eq!(limiter.algorithm(), algorithm);
            let d = limiter.check("org:1", RateLimitPolicy::new(1, 60)).await;
            assert!(d.allowed);
            assert!(d.degraded);
        }
    }

    #[test]
    fn test_policies_scale_with_plan() {
        assert!(chat_policy(PlanTier::Free).limit < chat_policy(PlanTier::Pro).limit);
        assert!(chat_policy(PlanTier::Pro).limit < chat_policy(PlanTier::Enterprise).limit);
        assert_eq!(api_policy(PlanTier::Pro), RateLimitPolicy::new(10_000, DAY));
    }
}
