//! The cache coordinator: single-flight gating, TTL / geo validity and
//! bounded global eviction.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tidal_sync_types::{GeoPoint, Timestamp};

use super::error::{CacheError, FetchError};
use super::fingerprint::Fingerprint;
use super::policy::CachePolicy;
use crate::clock::{Clock, SystemClock};

/// Pending requests older than this are reclaimed by the sweep.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Format version stamped on new entries.
pub const ENTRY_FORMAT_VERSION: u32 = 1;

/// Shared handle to the eventual completion of an in-flight fetch.
///
/// Every caller told to [`Decision::AwaitPending`] awaits a clone of the same
/// future and observes the same result.
pub type PendingFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// What a caller should do about a request.
pub enum Decision<T> {
    /// Perform the fetch, register it with `attach_pending`, then `commit`.
    Issue,
    /// A valid cached result.
    UseCache(T),
    /// An identical fetch is in flight; await it.
    AwaitPending(PendingFetch<T>),
    /// Do not fetch; nothing is available.
    ///
    /// Returned inside the debounce window when there is neither a valid
    /// entry nor a pending fetch. A first-time caller racing a request that
    /// was issued but not yet attached or committed ends up with no data and
    /// nothing to await. This mirrors the behaviour the coordinator was
    /// modelled on and is likely a latent bug there; callers should treat
    /// `Suppress` as "retry later", not as "no data exists".
    Suppress,
}

impl<T> Decision<T> {
    /// Whether the caller must issue the fetch.
    pub fn is_issue(&self) -> bool {
        matches!(self, Self::Issue)
    }

    /// Whether the caller should await an in-flight fetch.
    pub fn is_await_pending(&self) -> bool {
        matches!(self, Self::AwaitPending(_))
    }

    /// Whether the request was suppressed.
    pub fn is_suppress(&self) -> bool {
        matches!(self, Self::Suppress)
    }

    /// The cached value, if this is a cache hit.
    pub fn cached(&self) -> Option<&T> {
        match self {
            Self::UseCache(data) => Some(data),
            _ => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Decision<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Issue => f.write_str("Issue"),
            Self::UseCache(data) => f.debug_tuple("UseCache").field(data).finish(),
            Self::AwaitPending(_) => f.write_str("AwaitPending(..)"),
            Self::Suppress => f.write_str("Suppress"),
        }
    }
}

/// A committed result.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    /// The cached payload (never inspected).
    pub data: T,
    /// Commit time.
    pub created_at: Timestamp,
    /// First instant at which the entry is no longer valid.
    pub expires_at: Timestamp,
    /// Caller location at commit time, for location-based policies.
    pub geo_anchor: Option<GeoPoint>,
    /// The entry's own key.
    pub fingerprint: Fingerprint,
    /// Entry format version.
    pub version: u32,
    /// Insertion order, breaks `created_at` ties during eviction.
    seq: u64,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// Identity of one registered in-flight fetch.
///
/// Used to tell whether a completing fetch still belongs to current state or
/// was orphaned by `clear_all`, `destroy`, a watchdog reclaim or a newer fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingTicket {
    fingerprint: Fingerprint,
    id: u64,
}

impl PendingTicket {
    /// The fingerprint of the request this ticket belongs to.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

struct PendingRequest<T> {
    future: PendingFetch<T>,
    started_at: Timestamp,
    id: u64,
}

/// Point-in-time counters for the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Cached entries.
    pub entries: usize,
    /// In-flight fetches.
    pub pending: usize,
    /// Registered namespaces.
    pub namespaces: usize,
    /// `UseCache` decisions.
    pub hits: u64,
    /// `Issue` decisions.
    pub issued: u64,
    /// `AwaitPending` decisions.
    pub dedup_waits: u64,
    /// `Suppress` decisions.
    pub suppressed: u64,
    /// Entries removed to respect `max_entries`.
    pub evictions: u64,
    /// Entries removed by the expiry sweep.
    pub expirations: u64,
    /// Pending requests reclaimed by the watchdog.
    pub reclaimed_pending: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    issued: u64,
    dedup_waits: u64,
    suppressed: u64,
    evictions: u64,
    expirations: u64,
    reclaimed_pending: u64,
}

/// Request fingerprinting, single-flight gating and caching.
///
/// One instance per process, owned by the application and passed to
/// consumers. The cached payload type `T` is opaque to the coordinator.
pub struct CacheCoordinator<T, C = SystemClock> {
    clock: C,
    pending_timeout: Duration,
    policies: HashMap<String, CachePolicy>,
    entries: HashMap<Fingerprint, CacheEntry<T>>,
    pending: HashMap<Fingerprint, PendingRequest<T>>,
    /// When each fingerprint last issued; windows come from the current policy.
    last_issued: HashMap<Fingerprint, Timestamp>,
    next_seq: u64,
    next_ticket: u64,
    counters: Counters,
}

impl<T> CacheCoordinator<T, SystemClock> {
    /// Create a coordinator reading the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<T> Default for CacheCoordinator<T, SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C: Clock> CacheCoordinator<T, C> {
    /// Create a coordinator reading the given clock.
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            policies: HashMap::new(),
            entries: HashMap::new(),
            pending: HashMap::new(),
            last_issued: HashMap::new(),
            next_seq: 0,
            next_ticket: 0,
            counters: Counters::default(),
        }
    }

    /// Override the pending-request watchdog duration.
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// The clock this coordinator reads.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Register (or replace) the policy for a namespace.
    pub fn register_policy(&mut self, namespace: impl Into<String>, policy: CachePolicy) {
        let namespace = namespace.into();
        tracing::debug!(namespace = %namespace, ?policy, "registered cache policy");
        self.policies.insert(namespace, policy);
    }

    /// Mutate a registered policy in place.
    pub fn update_policy(
        &mut self,
        namespace: &str,
        update: impl FnOnce(&mut CachePolicy),
    ) -> Result<(), CacheError> {
        let policy = self
            .policies
            .get_mut(namespace)
            .ok_or_else(|| configuration_error(namespace))?;
        update(policy);
        Ok(())
    }

    /// The policy registered for a namespace.
    pub fn policy(&self, namespace: &str) -> Option<&CachePolicy> {
        self.policies.get(namespace)
    }

    fn require_policy(&self, namespace: &str) -> Result<CachePolicy, CacheError> {
        self.policies
            .get(namespace)
            .cloned()
            .ok_or_else(|| configuration_error(namespace))
    }

    /// Run the expiry sweep now.
    ///
    /// Drops expired entries, pending requests older than the watchdog
    /// duration, and debounce markers whose window has passed. Also runs
    /// lazily at the start of every [`request_gate`](Self::request_gate).
    pub fn sweep(&mut self) {
        let now = self.clock.now();
        self.sweep_at(now);
    }

    fn sweep_at(&mut self, now: Timestamp) {
        let entries_before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        let expired = entries_before - self.entries.len();

        let timeout = self.pending_timeout;
        let pending_before = self.pending.len();
        self.pending.retain(|fingerprint, request| {
            let alive = now.saturating_since(request.started_at) < timeout;
            if !alive {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    timeout_ms = timeout.as_millis() as u64,
                    "reclaimed pending request after watchdog timeout"
                );
            }
            alive
        });
        let reclaimed = pending_before - self.pending.len();

        let policies = &self.policies;
        self.last_issued.retain(|fingerprint, issued_at| {
            policies
                .get(fingerprint.namespace())
                .is_some_and(|policy| now.saturating_since(*issued_at) < policy.debounce_window())
        });

        self.counters.expirations += expired as u64;
        self.counters.reclaimed_pending += reclaimed as u64;
        if expired > 0 || reclaimed > 0 {
            tracing::debug!(expired, reclaimed, "cache sweep");
        }
    }

    /// Drop entries by scope.
    ///
    /// - `operation` and `params` given: the exact fingerprint.
    /// - `operation` given, `params` omitted: every entry of `namespace:operation:`.
    /// - `operation` omitted: every entry of `namespace:` (`params` is ignored).
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(
        &mut self,
        namespace: &str,
        operation: Option<&str>,
        params: Option<&Value>,
    ) -> usize {
        let removed = match (operation, params) {
            (Some(op), Some(params)) => {
                let fingerprint = Fingerprint::new(namespace, op, params);
                usize::from(self.entries.remove(&fingerprint).is_some())
            }
            (operation, _) => {
                let before = self.entries.len();
                self.entries
                    .retain(|fingerprint, _| !fingerprint.is_within(namespace, operation));
                before - self.entries.len()
            }
        };
        tracing::debug!(namespace, operation, removed, "invalidated cache entries");
        removed
    }

    /// Drop every entry that carries a geo-anchor, across all namespaces.
    pub fn invalidate_by_location_change(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.geo_anchor.is_none());
        let removed = before - self.entries.len();
        tracing::debug!(removed, "invalidated geo-anchored cache entries");
        removed
    }

    /// The ticket of the fetch currently in flight for a request, if any.
    pub fn pending_ticket(
        &self,
        namespace: &str,
        operation: &str,
        params: &Value,
    ) -> Option<PendingTicket> {
        let fingerprint = Fingerprint::new(namespace, operation, params);
        let id = self.pending.get(&fingerprint)?.id;
        Some(PendingTicket { fingerprint, id })
    }

    /// Forget a pending request without committing (the fetch failed).
    ///
    /// Returns `false` if the ticket was already orphaned.
    pub fn release_pending(&mut self, ticket: &PendingTicket) -> bool {
        if self.is_current(ticket) {
            self.pending.remove(&ticket.fingerprint);
            true
        } else {
            false
        }
    }

    fn is_current(&self, ticket: &PendingTicket) -> bool {
        self.pending
            .get(&ticket.fingerprint)
            .is_some_and(|request| request.id == ticket.id)
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            pending: self.pending.len(),
            namespaces: self.policies.len(),
            hits: self.counters.hits,
            issued: self.counters.issued,
            dedup_waits: self.counters.dedup_waits,
            suppressed: self.counters.suppressed,
            evictions: self.counters.evictions,
            expirations: self.counters.expirations,
            reclaimed_pending: self.counters.reclaimed_pending,
        }
    }

    /// Drop all entries, pending requests and debounce markers. Policies stay.
    ///
    /// Fetches in flight keep running; their results are discarded by
    /// [`commit_pending`](Self::commit_pending).
    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.last_issued.clear();
        tracing::debug!("cleared cache");
    }

    /// Return to the freshly constructed state: no policies, no entries, zeroed counters.
    pub fn destroy(&mut self) {
        self.clear_all();
        self.policies.clear();
        self.counters = Counters::default();
    }

    fn store(
        &mut self,
        fingerprint: Fingerprint,
        data: T,
        location: Option<GeoPoint>,
        policy: &CachePolicy,
    ) {
        let now = self.clock.now();
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = CacheEntry {
            data,
            created_at: now,
            expires_at: now.saturating_add(policy.ttl()),
            geo_anchor: if policy.location_based { location } else { None },
            fingerprint: fingerprint.clone(),
            version: ENTRY_FORMAT_VERSION,
            seq,
        };

        self.pending.remove(&fingerprint);
        self.entries.insert(fingerprint, entry);
        self.evict_to(policy.max_entries);
    }

    /// Evict oldest entries (global, not per namespace) until `max_entries` remain.
    fn evict_to(&mut self, max_entries: usize) {
        let excess = self.entries.len().saturating_sub(max_entries);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(Timestamp, u64, Fingerprint)> = self
            .entries
            .values()
            .map(|entry| (entry.created_at, entry.seq, entry.fingerprint.clone()))
            .collect();
        by_age.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, fingerprint) in by_age.into_iter().take(excess) {
            self.entries.remove(&fingerprint);
            tracing::trace!(fingerprint = %fingerprint, "evicted cache entry");
        }
        self.counters.evictions += excess as u64;
    }

    fn usable_entry(
        &self,
        fingerprint: &Fingerprint,
        policy: &CachePolicy,
        location: Option<GeoPoint>,
        now: Timestamp,
    ) -> Option<&CacheEntry<T>> {
        let entry = self.entries.get(fingerprint)?;
        if !entry.is_fresh(now) {
            return None;
        }
        if policy.location_based {
            if let (Some(anchor), Some(here)) = (entry.geo_anchor, location) {
                if anchor.distance_meters(&here) > policy.location_threshold_meters {
                    return None;
                }
            }
        }
        Some(entry)
    }
}

impl<T: Clone, C: Clock> CacheCoordinator<T, C> {
    /// Decide what the caller should do about a request.
    ///
    /// Evaluation order: policy check, lazy sweep, valid cache entry, pending
    /// fetch, then either `Suppress` (inside the debounce window) or `Issue`
    /// (which starts a new debounce window).
    pub fn request_gate(
        &mut self,
        namespace: &str,
        operation: &str,
        params: &Value,
        location: Option<GeoPoint>,
    ) -> Result<Decision<T>, CacheError> {
        let policy = self.require_policy(namespace)?;
        let now = self.clock.now();
        self.sweep_at(now);

        let fingerprint = Fingerprint::new(namespace, operation, params);

        if let Some(entry) = self.usable_entry(&fingerprint, &policy, location, now) {
            let data = entry.data.clone();
            self.counters.hits += 1;
            return Ok(Decision::UseCache(data));
        }

        if let Some(request) = self.pending.get(&fingerprint) {
            let future = request.future.clone();
            self.counters.dedup_waits += 1;
            return Ok(Decision::AwaitPending(future));
        }

        let debouncing = self
            .last_issued
            .get(&fingerprint)
            .is_some_and(|issued_at| now.saturating_since(*issued_at) < policy.debounce_window());
        if debouncing {
            self.counters.suppressed += 1;
            tracing::debug!(fingerprint = %fingerprint, "suppressed request inside debounce window");
            return Ok(Decision::Suppress);
        }

        self.last_issued.insert(fingerprint, now);
        self.counters.issued += 1;
        Ok(Decision::Issue)
    }

    /// Store a result, replacing any previous entry for the same request.
    ///
    /// The geo-anchor is taken from `location` only for location-based
    /// policies. Any pending request for the fingerprint is cleared.
    pub fn commit(
        &mut self,
        namespace: &str,
        operation: &str,
        params: &Value,
        data: T,
        location: Option<GeoPoint>,
    ) -> Result<(), CacheError> {
        let policy = self.require_policy(namespace)?;
        let fingerprint = Fingerprint::new(namespace, operation, params);
        self.store(fingerprint, data, location, &policy);
        Ok(())
    }

    /// Commit a fetch result only if `ticket` still identifies the current
    /// pending request.
    ///
    /// Returns `Ok(false)` and discards `data` when the fetch was orphaned.
    pub fn commit_pending(
        &mut self,
        ticket: &PendingTicket,
        data: T,
        location: Option<GeoPoint>,
    ) -> Result<bool, CacheError> {
        let policy = self.require_policy(ticket.fingerprint.namespace())?;
        if !self.is_current(ticket) {
            tracing::debug!(
                fingerprint = %ticket.fingerprint,
                "discarding result of orphaned fetch"
            );
            return Ok(false);
        }
        self.store(ticket.fingerprint.clone(), data, location, &policy);
        Ok(true)
    }
}

impl<T, C> CacheCoordinator<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Clock,
{
    /// Register the in-flight fetch for a request and return its shared handle.
    ///
    /// Attaching twice for the same fingerprint is a no-op: a warning is
    /// logged and the already registered handle is returned.
    pub fn attach_pending<F>(
        &mut self,
        namespace: &str,
        operation: &str,
        params: &Value,
        fetch: F,
    ) -> Result<PendingFetch<T>, CacheError>
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.require_policy(namespace)?;
        let fingerprint = Fingerprint::new(namespace, operation, params);

        if let Some(existing) = self.pending.get(&fingerprint) {
            tracing::warn!(
                fingerprint = %fingerprint,
                "pending request already attached; ignoring duplicate"
            );
            return Ok(existing.future.clone());
        }

        let future = fetch.boxed().shared();
        let id = self.next_ticket;
        self.next_ticket += 1;
        self.pending.insert(
            fingerprint,
            PendingRequest {
                future: future.clone(),
                started_at: self.clock.now(),
                id,
            },
        );
        Ok(future)
    }
}

fn configuration_error(namespace: &str) -> CacheError {
    CacheError::Configuration {
        namespace: namespace.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    const NS: &str = "nearby";
    const OP: &str = "list";

    fn coordinator(policy: CachePolicy) -> (CacheCoordinator<String, ManualClock>, ManualClock) {
        let clock = ManualClock::new(Timestamp::zero());
        let mut cache = CacheCoordinator::with_clock(clock.clone());
        cache.register_policy(NS, policy);
        (cache, clock)
    }

    fn at(clock: &ManualClock, millis: u64) {
        clock.set(Timestamp::from_millis(millis));
    }

    fn ready(value: &str) -> impl Future<Output = Result<String, FetchError>> + Send + 'static {
        let value = value.to_string();
        async move { Ok(value) }
    }

    // ===========================================
    // Configuration
    // ===========================================

    #[test]
    fn unregistered_namespace_is_configuration_error() {
        let mut cache: CacheCoordinator<String, ManualClock> =
            CacheCoordinator::with_clock(ManualClock::default());

        let result = cache.request_gate("missing", OP, &json!({}), None);
        assert_eq!(
            result.unwrap_err(),
            CacheError::Configuration {
                namespace: "missing".into()
            }
        );
        assert!(cache
            .commit("missing", OP, &json!({}), "x".into(), None)
            .is_err());
        assert!(cache
            .attach_pending("missing", OP, &json!({}), ready("x"))
            .is_err());
    }

    #[test]
    fn registered_namespace_never_errors() {
        let (mut cache, clock) = coordinator(CachePolicy::default());
        for t in 0..20 {
            at(&clock, t * 700);
            assert!(cache.request_gate(NS, OP, &json!({"t": t % 3}), None).is_ok());
        }
    }

    #[test]
    fn update_policy_requires_registration() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        cache.update_policy(NS, |p| p.max_entries = 7).unwrap();
        assert_eq!(cache.policy(NS).unwrap().max_entries, 7);
        assert!(cache.update_policy("other", |_| {}).is_err());
    }

    // ===========================================
    // TTL scenario
    // ===========================================

    #[test]
    fn ttl_scenario_issue_commit_hit_expire() {
        let policy = CachePolicy::default()
            .with_ttl(Duration::from_millis(5000))
            .with_debounce(Duration::from_millis(1000));
        let (mut cache, clock) = coordinator(policy);
        let params = json!({"page": 1});

        at(&clock, 0);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());

        at(&clock, 10);
        cache.commit(NS, OP, &params, "X".into(), None).unwrap();

        at(&clock, 100);
        let hit = cache.request_gate(NS, OP, &params, None).unwrap();
        assert_eq!(hit.cached(), Some(&"X".to_string()));

        at(&clock, 6000);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());
    }

    #[test]
    fn entry_valid_strictly_before_expiry() {
        let policy = CachePolicy::default()
            .with_ttl(Duration::from_millis(1000))
            .with_debounce(Duration::ZERO);
        let (mut cache, clock) = coordinator(policy);
        let params = json!({});

        at(&clock, 500);
        cache.commit(NS, OP, &params, "v".into(), None).unwrap();

        at(&clock, 1499);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().cached().is_some());

        at(&clock, 1500);
        let decision = cache.request_gate(NS, OP, &params, None).unwrap();
        assert!(decision.cached().is_none());
        assert!(decision.is_issue());
    }

    // ===========================================
    // Single-flight and debounce
    // ===========================================

    #[test]
    fn single_flight_one_issue_rest_await() {
        let (mut cache, clock) = coordinator(CachePolicy::default());
        let params = json!({"q": "coffee"});
        at(&clock, 0);

        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());
        cache.attach_pending(NS, OP, &params, ready("beans")).unwrap();

        for _ in 0..9 {
            let decision = cache.request_gate(NS, OP, &params, None).unwrap();
            assert!(decision.is_await_pending(), "got {decision:?}");
        }
        let stats = cache.stats();
        assert_eq!(stats.issued, 1);
        assert_eq!(stats.dedup_waits, 9);
    }

    #[tokio::test]
    async fn awaiting_callers_share_the_result() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        let params = json!({});
        cache.request_gate(NS, OP, &params, None).unwrap();
        let handle = cache.attach_pending(NS, OP, &params, ready("shared")).unwrap();

        let Decision::AwaitPending(other) = cache.request_gate(NS, OP, &params, None).unwrap()
        else {
            panic!("expected AwaitPending");
        };

        assert_eq!(handle.await.unwrap(), "shared");
        assert_eq!(other.await.unwrap(), "shared");
    }

    #[test]
    fn debounce_without_cache_or_pending_suppresses() {
        let policy = CachePolicy::default().with_debounce(Duration::from_millis(1000));
        let (mut cache, clock) = coordinator(policy);
        let params = json!({});

        at(&clock, 0);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());

        // Issued but never attached nor committed.
        at(&clock, 500);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_suppress());

        at(&clock, 1000);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());
        assert_eq!(cache.stats().suppressed, 1);
    }

    #[test]
    fn lengthened_debounce_window_survives_sweep() {
        let policy = CachePolicy::default().with_debounce(Duration::from_millis(1000));
        let (mut cache, clock) = coordinator(policy);
        let params = json!({});

        at(&clock, 0);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());

        cache.update_policy(NS, |p| p.debounce_ms = 3000).unwrap();
        at(&clock, 1500);
        cache.sweep();
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_suppress());

        at(&clock, 3000);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());
    }

    #[test]
    fn shortened_debounce_window_applies_immediately() {
        let policy = CachePolicy::default().with_debounce(Duration::from_millis(5000));
        let (mut cache, clock) = coordinator(policy);
        let params = json!({});

        at(&clock, 0);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());

        cache.update_policy(NS, |p| p.debounce_ms = 200).unwrap();
        at(&clock, 300);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());
    }

    #[test]
    fn debounce_prefers_cache_then_pending() {
        let (mut cache, clock) = coordinator(CachePolicy::default());
        let params = json!({});

        at(&clock, 0);
        cache.request_gate(NS, OP, &params, None).unwrap();
        cache.attach_pending(NS, OP, &params, ready("p")).unwrap();

        at(&clock, 100);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_await_pending());

        cache.commit(NS, OP, &params, "c".into(), None).unwrap();
        at(&clock, 200);
        let decision = cache.request_gate(NS, OP, &params, None).unwrap();
        assert_eq!(decision.cached(), Some(&"c".to_string()));
    }

    #[test]
    fn duplicate_attach_is_noop() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        let params = json!({});
        cache.attach_pending(NS, OP, &params, ready("first")).unwrap();
        let ticket = cache.pending_ticket(NS, OP, &params).unwrap();

        cache.attach_pending(NS, OP, &params, ready("second")).unwrap();

        assert_eq!(cache.pending_ticket(NS, OP, &params), Some(ticket));
        assert_eq!(cache.stats().pending, 1);
    }

    #[test]
    fn commit_clears_pending() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        let params = json!({});
        cache.attach_pending(NS, OP, &params, ready("x")).unwrap();
        cache.commit(NS, OP, &params, "x".into(), None).unwrap();
        assert_eq!(cache.stats().pending, 0);
    }

    #[test]
    fn watchdog_reclaims_stale_pending() {
        let (mut cache, clock) = coordinator(CachePolicy::default());
        let params = json!({});

        at(&clock, 0);
        cache.request_gate(NS, OP, &params, None).unwrap();
        cache.attach_pending(NS, OP, &params, ready("slow")).unwrap();

        at(&clock, 29_999);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_await_pending());

        at(&clock, 30_000);
        assert!(cache.request_gate(NS, OP, &params, None).unwrap().is_issue());
        assert_eq!(cache.stats().reclaimed_pending, 1);
    }

    #[test]
    fn orphaned_fetch_result_is_discarded() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        let params = json!({});
        cache.attach_pending(NS, OP, &params, ready("old")).unwrap();
        let ticket = cache.pending_ticket(NS, OP, &params).unwrap();

        cache.clear_all();

        assert!(!cache.commit_pending(&ticket, "old".into(), None).unwrap());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn current_ticket_commits() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        let params = json!({});
        cache.attach_pending(NS, OP, &params, ready("new")).unwrap();
        let ticket = cache.pending_ticket(NS, OP, &params).unwrap();

        assert!(cache.commit_pending(&ticket, "new".into(), None).unwrap());
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().pending, 0);
    }

    #[test]
    fn release_pending_only_matches_current_ticket() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        let params = json!({});
        cache.attach_pending(NS, OP, &params, ready("a")).unwrap();
        let stale = cache.pending_ticket(NS, OP, &params).unwrap();
        cache.clear_all();
        cache.attach_pending(NS, OP, &params, ready("b")).unwrap();

        assert!(!cache.release_pending(&stale));
        assert_eq!(cache.stats().pending, 1);

        let current = cache.pending_ticket(NS, OP, &params).unwrap();
        assert!(cache.release_pending(&current));
        assert_eq!(cache.stats().pending, 0);
    }

    // ===========================================
    // Location
    // ===========================================

    #[test]
    fn location_based_entry_respects_threshold() {
        let policy = CachePolicy::default().location_based(500.0);
        let (mut cache, _) = coordinator(policy);
        let params = json!({});
        let anchor = GeoPoint::new(37.5665, 126.9780);

        cache
            .commit(NS, OP, &params, "here".into(), Some(anchor))
            .unwrap();

        // ~111 m north
        let near = GeoPoint::new(37.5675, 126.9780);
        let decision = cache.request_gate(NS, OP, &params, Some(near)).unwrap();
        assert_eq!(decision.cached(), Some(&"here".to_string()));

        // ~1.1 km north
        let far = GeoPoint::new(37.5765, 126.9780);
        let decision = cache.request_gate(NS, OP, &params, Some(far)).unwrap();
        assert!(decision.cached().is_none());
    }

    #[test]
    fn location_ignored_when_policy_not_location_based() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        let params = json!({});
        cache
            .commit(NS, OP, &params, "v".into(), Some(GeoPoint::new(0.0, 0.0)))
            .unwrap();

        let far = GeoPoint::new(10.0, 10.0);
        assert!(cache
            .request_gate(NS, OP, &params, Some(far))
            .unwrap()
            .cached()
            .is_some());
        // No anchor stamped, so a location change leaves it alone.
        assert_eq!(cache.invalidate_by_location_change(), 0);
    }

    #[test]
    fn missing_current_location_skips_distance_check() {
        let policy = CachePolicy::default().location_based(10.0);
        let (mut cache, _) = coordinator(policy);
        let params = json!({});
        cache
            .commit(NS, OP, &params, "v".into(), Some(GeoPoint::new(0.0, 0.0)))
            .unwrap();

        assert!(cache.request_gate(NS, OP, &params, None).unwrap().cached().is_some());
    }

    #[test]
    fn invalidate_by_location_change_drops_anchored_entries_everywhere() {
        let (mut cache, _) = coordinator(CachePolicy::default().location_based(100.0));
        cache.register_policy("plain", CachePolicy::default());
        let here = Some(GeoPoint::new(1.0, 1.0));

        cache.commit(NS, OP, &json!({"a": 1}), "a".into(), here).unwrap();
        cache.commit(NS, OP, &json!({"a": 2}), "b".into(), here).unwrap();
        cache.commit("plain", OP, &json!({}), "c".into(), here).unwrap();

        assert_eq!(cache.invalidate_by_location_change(), 2);
        assert_eq!(cache.stats().entries, 1);
    }

    // ===========================================
    // Eviction
    // ===========================================

    #[test]
    fn eviction_keeps_exactly_max_entries_oldest_first() {
        let policy = CachePolicy::default().with_max_entries(3);
        let (mut cache, clock) = coordinator(policy);

        for i in 0..6u64 {
            at(&clock, i * 10);
            cache
                .commit(NS, OP, &json!({ "i": i }), format!("v{i}"), None)
                .unwrap();
        }

        assert_eq!(cache.stats().entries, 3);
        assert_eq!(cache.stats().evictions, 3);
        for i in 0..3u64 {
            let decision = cache.request_gate(NS, OP, &json!({ "i": i }), None).unwrap();
            assert!(decision.cached().is_none(), "entry {i} should be evicted");
        }
        for i in 3..6u64 {
            let decision = cache.request_gate(NS, OP, &json!({ "i": i }), None).unwrap();
            assert_eq!(decision.cached(), Some(&format!("v{i}")));
        }
    }

    #[test]
    fn eviction_is_global_across_namespaces() {
        let (mut cache, clock) = coordinator(CachePolicy::default());
        cache.register_policy("small", CachePolicy::default().with_max_entries(2));

        at(&clock, 0);
        cache.commit(NS, OP, &json!({"n": 1}), "old".into(), None).unwrap();
        at(&clock, 10);
        cache.commit(NS, OP, &json!({"n": 2}), "mid".into(), None).unwrap();
        at(&clock, 20);
        cache.commit("small", OP, &json!({}), "new".into(), None).unwrap();

        assert_eq!(cache.stats().entries, 2);
        assert!(cache
            .request_gate(NS, OP, &json!({"n": 1}), None)
            .unwrap()
            .cached()
            .is_none());
    }

    #[test]
    fn same_millisecond_ties_evict_in_insertion_order() {
        let (mut cache, _) = coordinator(CachePolicy::default().with_max_entries(1));
        cache.commit(NS, OP, &json!({"n": 1}), "first".into(), None).unwrap();
        cache.commit(NS, OP, &json!({"n": 2}), "second".into(), None).unwrap();

        let decision = cache.request_gate(NS, OP, &json!({"n": 2}), None).unwrap();
        assert_eq!(decision.cached(), Some(&"second".to_string()));
    }

    // ===========================================
    // Invalidation and lifecycle
    // ===========================================

    #[test]
    fn invalidate_granularities() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        cache.register_policy("other", CachePolicy::default());

        cache.commit(NS, "list", &json!({"p": 1}), "a".into(), None).unwrap();
        cache.commit(NS, "list", &json!({"p": 2}), "b".into(), None).unwrap();
        cache.commit(NS, "count", &json!({}), "c".into(), None).unwrap();
        cache.commit("other", "list", &json!({}), "d".into(), None).unwrap();

        assert_eq!(cache.invalidate(NS, Some("list"), Some(&json!({"p": 1}))), 1);
        assert_eq!(cache.stats().entries, 3);

        assert_eq!(cache.invalidate(NS, Some("list"), None), 1);
        assert_eq!(cache.stats().entries, 2);

        assert_eq!(cache.invalidate(NS, None, None), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn recommit_replaces_entry() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        let params = json!({});
        cache.commit(NS, OP, &params, "v1".into(), None).unwrap();
        cache.commit(NS, OP, &params, "v2".into(), None).unwrap();

        assert_eq!(cache.stats().entries, 1);
        let decision = cache.request_gate(NS, OP, &params, None).unwrap();
        assert_eq!(decision.cached(), Some(&"v2".to_string()));
    }

    #[test]
    fn clear_all_keeps_policies_destroy_drops_them() {
        let (mut cache, _) = coordinator(CachePolicy::default());
        cache.commit(NS, OP, &json!({}), "v".into(), None).unwrap();

        cache.clear_all();
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.request_gate(NS, OP, &json!({}), None).is_ok());

        cache.destroy();
        assert_eq!(cache.stats(), CacheStats::default());
        assert!(cache.request_gate(NS, OP, &json!({}), None).is_err());
    }

    #[test]
    fn sweep_counts_expirations() {
        let policy = CachePolicy::default().with_ttl(Duration::from_millis(100));
        let (mut cache, clock) = coordinator(policy);
        cache.commit(NS, OP, &json!({}), "v".into(), None).unwrap();

        at(&clock, 100);
        cache.sweep();

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.expirations, 1);
    }
}
