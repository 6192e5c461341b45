//! In-process cache backed by DashMap. Expiry follows the injected clock,
//! so tests can step over window boundaries without sleeping.

use crate::backend::{CacheBackend, CacheError, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use taskflow_core::Clock;

enum CacheValue {
    Counter(i64),
    /// (score, member)
    SortedSet(Vec<(i64, String)>),
}

struct CacheEntry {
    value: CacheValue,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn counter() -> Self {
        Self {
            value: CacheValue::Counter(0),
            expires_at: None,
        }
    }

    fn sorted_set() -> Self {
        Self {
            value: CacheValue::SortedSet(Vec::new()),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Lock-free local stand-in for Redis.
pub struct LocalCache {
    store: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl LocalCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: DashMap::new(),
            clock,
        }
    }

    /// Drop expired keys. Call periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.is_expired(now));
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn live_entry(
        &self,
        key: &str,
    ) -> Option<dashmap::mapref::one::Ref<'_, String, CacheEntry>> {
        let now = self.clock.now();
        let entry = self.store.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    async fn incr(&self, key: &str) -> CacheResult<i64> {
        let now = self.clock.now();
        let mut entry = self
            .store
            .entry(key.to_string())
            .or_insert_with(CacheEntry::counter);
        if entry.is_expired(now) {
            *entry = CacheEntry::counter();
        }
        match &mut entry.value {
            CacheValue::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            CacheValue::SortedSet(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> CacheResult<()> {
        let now = self.clock.now();
        if let Some(mut entry) = self.store.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = Some(now + Duration::seconds(ttl_secs as i64));
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> CacheResult<i64> {
        let now = self.clock.now();
        let Some(entry) = self.live_entry(key) else {
            return Ok(-2);
        };
        Ok(match entry.expires_at {
            None => -1,
            Some(at) => {
                let ms = (at - now).num_milliseconds();
                (ms + 999) / 1000
            }
        })
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> CacheResult<()> {
        let now = self.clock.now();
        let mut entry = self
            .store
            .entry(key.to_string())
            .or_insert_with(CacheEntry::sorted_set);
        if entry.is_expired(now) {
            *entry = CacheEntry::sorted_set();
        }
        match &mut entry.value {
            CacheValue::SortedSet(members) => {
                members.retain(|(_, m)| m != member);
                members.push((score, member.to_string()));
                members.sort();
                Ok(())
            }
            CacheValue::Counter(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> CacheResult<u64> {
        let now = self.clock.now();
        let Some(mut entry) = self.store.get_mut(key) else {
            return Ok(0);
        };
        if entry.is_expired(now) {
            drop(entry);
            self.store.remove(key);
            return Ok(0);
        }
        let (removed, now_empty) = match &mut entry.value {
            CacheValue::SortedSet(members) => {
                let before = members.len();
                members.retain(|(score, _)| *score < min || *score > max);
                ((before - members.len()) as u64, members.is_empty())
            }
            CacheValue::Counter(_) => return Err(CacheError::WrongType(key.to_string())),
        };
        drop(entry);
        if now_empty {
            self.store.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> CacheResult<u64> {
        let Some(entry) = self.live_entry(key) else {
            return Ok(0);
        };
        match &entry.value {
            CacheValue::SortedSet(members) => Ok(members.len() as u64),
            CacheValue::Counter(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn zoldest(&self, key: &str) -> CacheResult<Option<i64>> {
        let Some(entry) = self.live_entry(key) else {
            return Ok(None);
        };
        match &entry.value {
            CacheValue::SortedSet(members) => Ok(members.first().map(|(score, _)| *score)),
            CacheValue::Counter(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}
