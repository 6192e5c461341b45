use async_trait::async_trait;
use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Primitives the rate limiter needs from a Redis-like store.
///
/// Scores are unix milliseconds.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Atomically increment a counter, creating it at 1.
    async fn incr(&self, key: &str) -> CacheResult<i64>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> CacheResult<()>;

    /// Remaining time to live in seconds: -2 if the key is missing,
    /// -1 if it has no expiry.
    async fn ttl(&self, key: &str) -> CacheResult<i64>;

    async fn zadd(&self, key: &str, score: i64, member: &str) -> CacheResult<()>;

    /// Remove sorted-set members with `min <= score <= max`. Returns how many.
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> CacheResult<u64>;

    async fn zcard(&self, key: &str) -> CacheResult<u64>;

    /// Score of the lowest-ranked member, if any.
    async fn zoldest(&self, key: &str) -> CacheResult<Option<i64>>;

    async fn ping(&self) -> CacheResult<()>;
}
