//! Cache configuration.
//!
//! Controls entry lifetime, store call budget and in-memory capacity via the
//! `[cache]` table of `memoserve.toml`.

use std::{num::NonZeroUsize, time::Duration};

const DEFAULT_TTL_SECS: u64 = 15 * 60;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
const DEFAULT_MEMORY_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of every entry written to the store.
    pub ttl: Duration,
    /// Budget for a store `get`; slower lookups count as misses.
    pub store_timeout: Duration,
    /// Maximum entries held by the in-memory store.
    pub memory_capacity: NonZeroUsize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl: settings.ttl,
            store_timeout: settings.store_timeout,
            memory_capacity: settings.memory_capacity,
        }
    }
}
