//! Single-flight registry for in-progress computations.
//!
//! The first request for a key becomes the leader: its computation is spawned
//! onto its own task and every later request for the same key joins the shared
//! result instead of starting new work. The registry entry is removed by the
//! computation task itself when it settles, whatever the outcome and whether or
//! not anyone is still waiting.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use metrics::{counter, gauge, histogram};
use tracing::{debug, error};

use crate::application::error::ComputationError;

use super::keys::CacheKey;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, ComputationError>>>;

struct InFlight<T> {
    generation: u64,
    waiters: Arc<AtomicUsize>,
    result: SharedResult<T>,
}

/// Registry of computations currently running, at most one per key.
pub struct Coalescer<T> {
    inflight: Arc<DashMap<CacheKey, InFlight<T>>>,
    generations: Arc<AtomicU64>,
}

impl<T> Clone for Coalescer<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            generations: Arc::clone(&self.generations),
        }
    }
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the result for `key`, starting `computation` only if nothing is
    /// already in flight for it.
    ///
    /// `computation` is called at most once per settled result; joiners drop
    /// their closure unused and observe the leader's value or error.
    pub async fn register<F, Fut>(&self, key: CacheKey, computation: F) -> Result<T, ComputationError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ComputationError>> + Send + 'static,
    {
        let (result, waiting) = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let waiting = WaiterGuard::join(&entry.get().waiters);
                let waiters = entry.get().waiters.load(Ordering::Acquire);
                counter!("memoserve_coalesce_joined_total").increment(1);
                debug!(key = %key, waiters, role = "follower", "joining in-flight computation");
                (entry.get().result.clone(), waiting)
            }
            Entry::Vacant(entry) => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                let guard = SettleGuard {
                    key: key.clone(),
                    generation,
                    inflight: Arc::clone(&self.inflight),
                };
                let result = spawn_computation(key.clone(), guard, computation);
                let waiters = Arc::new(AtomicUsize::new(0));
                let waiting = WaiterGuard::join(&waiters);
                entry.insert(InFlight {
                    generation,
                    waiters,
                    result: result.clone(),
                });
                counter!("memoserve_coalesce_started_total").increment(1);
                debug!(key = %key, role = "leader", "starting computation");
                (result, waiting)
            }
        };
        gauge!("memoserve_coalesce_in_flight").set(self.inflight.len() as f64);

        let outcome = result.await;
        drop(waiting);
        outcome
    }

    /// Number of keys with a computation in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Number of requests still awaiting the computation for `key`, leader
    /// included. Callers that were dropped while waiting are not counted.
    pub fn waiters(&self, key: &CacheKey) -> Option<usize> {
        self.inflight
            .get(key)
            .map(|entry| entry.waiters.load(Ordering::Acquire))
    }
}

fn spawn_computation<T, F, Fut>(
    key: CacheKey,
    guard: SettleGuard<T>,
    computation: F,
) -> SharedResult<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ComputationError>> + Send + 'static,
{
    // Spawning is deferred to the first poll so the registry shard is never
    // locked while the task starts.
    async move {
        let task = tokio::spawn(async move {
            let _guard = guard;
            let started = Instant::now();
            let result = computation().await;
            histogram!("memoserve_compute_ms").record(started.elapsed().as_secs_f64() * 1000.0);
            result
        });

        match task.await {
            Ok(result) => result,
            Err(err) => {
                error!(key = %key, error = %err, "computation task did not complete");
                Err(ComputationError::aborted("computation task did not complete").with_cause(&err))
            }
        }
    }
    .boxed()
    .shared()
}

/// One caller awaiting a shared result; leaves the count when dropped.
struct WaiterGuard(Arc<AtomicUsize>);

impl WaiterGuard {
    fn join(waiters: &Arc<AtomicUsize>) -> Self {
        waiters.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(waiters))
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Removes the registry entry of one computation when dropped.
struct SettleGuard<T> {
    key: CacheKey,
    generation: u64,
    inflight: Arc<DashMap<CacheKey, InFlight<T>>>,
}

impl<T> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.inflight
            .remove_if(&self.key, |_, entry| entry.generation == generation);
        gauge!("memoserve_coalesce_in_flight").set(self.inflight.len() as f64);
    }
}
