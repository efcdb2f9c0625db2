//! Memoizing content server.
//!
//! Requests are reduced to namespaced cache keys, served from a TTL store when
//! possible and otherwise computed once per key no matter how many callers ask
//! concurrently.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
