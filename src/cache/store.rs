//! Cache store boundary.
//!
//! The pipeline only ever talks to a [`CacheStore`] through `get` and `set`.
//! Both calls are allowed to fail; callers treat failures as misses or
//! dropped writes. [`MemoryStore`] is the in-process implementation.

use std::{
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;

use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache store rejected entry: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Async TTL key/value store shared by every request.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the value stored under `key`, or `None` when absent or expired.
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError>;

    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<(), StoreError>;
}

struct StoredEntry {
    value: Bytes,
    expires_at: Instant,
}

/// Bounded in-memory store with per-entry expiry.
///
/// Expired entries are dropped lazily when read; capacity pressure evicts the
/// least recently used entry.
pub struct MemoryStore {
    entries: Mutex<LruCache<CacheKey, StoredEntry>>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &CacheKey, now: Instant) -> Option<Bytes> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    fn insert(
        &self,
        key: &CacheKey,
        value: Bytes,
        ttl: Duration,
        now: Instant,
    ) -> Result<(), StoreError> {
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| StoreError::Rejected(format!("ttl {ttl:?} is out of range")))?;

        let evicted = mutex_lock(&self.entries, SOURCE, "set")
            .push(key.clone(), StoredEntry { value, expires_at });
        if let Some((evicted_key, _)) = evicted
            && &evicted_key != key
        {
            counter!("memoserve_cache_evict_total").increment(1);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError> {
        Ok(self.lookup(key, Instant::now()))
    }

    async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.insert(key, value, ttl, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::cache::keys::derive_key;

    fn store(capacity: usize) -> MemoryStore {
        MemoryStore::new(NonZeroUsize::new(capacity).expect("non-zero capacity"))
    }

    fn key(name: &str) -> CacheKey {
        derive_key("store", name).expect("key")
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let store = store(4);
        let key = key("thumbnail");

        assert_eq!(store.get(&key).await.expect("get"), None);
        store
            .set(&key, Bytes::from_static(b"jpeg"), Duration::from_secs(60))
            .await
            .expect("set");

        assert_eq!(
            store.get(&key).await.expect("get"),
            Some(Bytes::from_static(b"jpeg"))
        );
    }

    #[test]
    fn entries_expire_after_ttl() {
        let store = store(4);
        let key = key("embed");
        let now = Instant::now();

        store
            .insert(&key, Bytes::from_static(b"<html>"), Duration::from_secs(900), now)
            .expect("insert");

        assert!(store.lookup(&key, now + Duration::from_secs(899)).is_some());
        assert!(store.lookup(&key, now + Duration::from_secs(900)).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn overwriting_refreshes_value_and_expiry() {
        let store = store(4);
        let key = key("css");
        let now = Instant::now();

        store
            .insert(&key, Bytes::from_static(b"old"), Duration::from_secs(1), now)
            .expect("insert");
        store
            .insert(&key, Bytes::from_static(b"new"), Duration::from_secs(10), now)
            .expect("insert");

        assert_eq!(
            store.lookup(&key, now + Duration::from_secs(5)),
            Some(Bytes::from_static(b"new"))
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let store = store(2);
        let now = Instant::now();
        let ttl = Duration::from_secs(60);

        store.insert(&key("a"), Bytes::from_static(b"a"), ttl, now).expect("insert");
        store.insert(&key("b"), Bytes::from_static(b"b"), ttl, now).expect("insert");
        assert!(store.lookup(&key("a"), now).is_some());
        store.insert(&key("c"), Bytes::from_static(b"c"), ttl, now).expect("insert");

        assert!(store.lookup(&key("a"), now).is_some());
        assert!(store.lookup(&key("b"), now).is_none());
        assert!(store.lookup(&key("c"), now).is_some());
    }

    #[test]
    fn out_of_range_ttl_is_rejected() {
        let store = store(2);
        let result = store.insert(&key("far"), Bytes::new(), Duration::MAX, Instant::now());
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let store = store(2);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .lock()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        let now = Instant::now();
        store
            .insert(&key("after"), Bytes::from_static(b"ok"), Duration::from_secs(1), now)
            .expect("insert");
        assert!(store.lookup(&key("after"), now).is_some());
    }
}
