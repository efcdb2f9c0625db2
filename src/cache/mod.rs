//! Memoserve cache system.
//!
//! Responses are memoized in three steps:
//!
//! - **Keys**: every request is reduced to a namespaced, order-insensitive
//!   digest (`keys`).
//! - **Store**: a best-effort TTL store is consulted first; failures read as
//!   misses (`store`).
//! - **Coalescing**: on a miss, concurrent requests for one key share a single
//!   computation (`coalescer`), whose result is written back asynchronously.
//!
//! `pipeline` ties these together and owns the not-found fallback.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! ttl_seconds = 900
//! store_timeout_ms = 250
//! memory_capacity = 1024
//! ```

mod coalescer;
mod config;
mod keys;
mod lock;
mod pipeline;
mod store;

pub use coalescer::Coalescer;
pub use config::CacheConfig;
pub use keys::{CacheKey, canonicalize, derive_key, derive_key_from_value};
pub use pipeline::{
    Content, NOT_FOUND_BODY, NOT_FOUND_CONTENT_TYPE, ResponsePipeline, fallback_layer,
    not_found_response,
};
pub use store::{CacheStore, MemoryStore, StoreError};
