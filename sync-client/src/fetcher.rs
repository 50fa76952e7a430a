//! Async single-flight fetching on top of the cache coordinator.
//!
//! [`CachedFetcher`] runs the whole gate protocol for a caller: reuse a cached
//! result, join a fetch already in flight, skip a debounced repeat, or issue
//! the fetch and commit what it returns.

use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tidal_sync_core::{
    CacheCoordinator, CacheError, CachePolicy, CacheStats, Clock, Decision, FetchError,
    PendingFetch, PendingTicket, SystemClock,
};
use tidal_sync_types::GeoPoint;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::lock::mutex_lock;

/// Errors from [`CachedFetcher::get_or_fetch`].
#[derive(Debug, Clone, Error)]
pub enum FetcherError {
    /// The namespace has no registered policy.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The fetch (ours or the one we joined) failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Shared handle to a [`CacheCoordinator`] that performs fetches.
///
/// The coordinator lock is never held across an `.await`. Clones share the
/// same cache.
pub struct CachedFetcher<T, C = SystemClock> {
    cache: Arc<Mutex<CacheCoordinator<T, C>>>,
}

impl<T, C> Clone for CachedFetcher<T, C> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<T> Default for CachedFetcher<T, SystemClock> {
    fn default() -> Self {
        Self::new(CacheCoordinator::new())
    }
}

impl<T, C: Clock> CachedFetcher<T, C> {
    /// Wrap an existing coordinator.
    pub fn new(cache: CacheCoordinator<T, C>) -> Self {
        Self {
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, CacheCoordinator<T, C>> {
        mutex_lock(&self.cache, "fetcher", op)
    }

    /// Register (or replace) the policy for a namespace.
    pub fn register_policy(&self, namespace: impl Into<String>, policy: CachePolicy) {
        self.lock("register_policy")
            .register_policy(namespace, policy);
    }

    /// Run `f` with exclusive access to the coordinator.
    ///
    /// `f` must not block; the lock is shared with every caller.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut CacheCoordinator<T, C>) -> R) -> R {
        f(&mut self.lock("with_cache"))
    }

    /// Drop entries by scope. See [`CacheCoordinator::invalidate`].
    pub fn invalidate(
        &self,
        namespace: &str,
        operation: Option<&str>,
        params: Option<&Value>,
    ) -> usize {
        self.lock("invalidate")
            .invalidate(namespace, operation, params)
    }

    /// Drop every geo-anchored entry.
    pub fn invalidate_by_location_change(&self) -> usize {
        self.lock("invalidate_by_location_change")
            .invalidate_by_location_change()
    }

    /// Run the expiry sweep now.
    pub fn sweep(&self) {
        self.lock("sweep").sweep();
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.lock("stats").stats()
    }
}

impl<T, C> CachedFetcher<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Clock,
{
    /// Return the result for a request, fetching it at most once.
    ///
    /// - cached and valid: returned without calling `fetch`
    /// - already in flight: waits for that fetch
    /// - repeated inside the debounce window with nothing cached or pending:
    ///   `Ok(None)`
    /// - otherwise `fetch` is called, its result committed and returned
    ///
    /// `fetch` is invoked under the coordinator lock but only to build the
    /// future; the future runs after the lock is released. A failed fetch
    /// clears the pending request and is returned to every waiter.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        namespace: &str,
        operation: &str,
        params: &Value,
        location: Option<GeoPoint>,
        fetch: F,
    ) -> Result<Option<T>, FetcherError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let (pending, ticket): (PendingFetch<T>, Option<PendingTicket>) = {
            let mut cache = self.lock("get_or_fetch");
            let decision = cache.request_gate(namespace, operation, params, location)?;
            match decision {
                Decision::UseCache(data) => return Ok(Some(data)),
                Decision::Suppress => return Ok(None),
                Decision::AwaitPending(pending) => (pending, None),
                Decision::Issue => {
                    tracing::debug!(namespace, operation, "issuing fetch");
                    let pending = cache.attach_pending(namespace, operation, params, fetch())?;
                    let ticket = cache.pending_ticket(namespace, operation, params);
                    (pending, ticket)
                }
            }
        };

        let result = pending.await;

        // Waiters only read; the issuer owns commit and release.
        let Some(ticket) = ticket else {
            return Ok(Some(result?));
        };

        let mut cache = self.lock("get_or_fetch");
        match result {
            Ok(data) => {
                cache.commit_pending(&ticket, data.clone(), location)?;
                Ok(Some(data))
            }
            Err(e) => {
                cache.release_pending(&ticket);
                tracing::warn!(namespace, operation, error = %e, "fetch failed");
                Err(e.into())
            }
        }
    }
}

/// Spawn a background task that runs the cache expiry sweep on an interval.
///
/// Returns a handle that can be used to abort the task. A zero interval
/// disables the task.
pub fn spawn_sweep_task<T, C>(fetcher: CachedFetcher<T, C>, every: Duration) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    C: Clock + 'static,
{
    tokio::spawn(async move {
        if every.is_zero() {
            tracing::info!("cache sweep task disabled");
            return;
        }

        tracing::info!(interval_ms = every.as_millis() as u64, "cache sweep task started");
        let mut timer = interval(every);

        loop {
            timer.tick().await;

            let before = fetcher.stats();
            fetcher.sweep();
            let after = fetcher.stats();

            let expired = after.expirations - before.expirations;
            let reclaimed = after.reclaimed_pending - before.reclaimed_pending;
            if expired > 0 || reclaimed > 0 {
                tracing::info!(expired, reclaimed, entries = after.entries, "cache sweep");
            } else {
                tracing::trace!("cache sweep: nothing to drop");
            }
        }
    })
}
