//! Walk the cache coordinator through a scripted timeline.

use anyhow::Result;
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidal_sync_client::CachedFetcher;
use tidal_sync_core::{
    CacheCoordinator, CachePolicy, CacheStats, Decision, FetchError, ManualClock,
};
use tidal_sync_types::Timestamp;
use tokio::time::sleep;

const NAMESPACE: &str = "nearby";
const OPERATION: &str = "search";
const CONCURRENT_CALLERS: usize = 5;

/// Outcome of the demo.
#[derive(Debug)]
pub struct Report {
    /// `(millis, decision)` for each gate call on the TTL timeline.
    pub timeline: Vec<(u64, &'static str)>,
    /// Fetches actually performed by the concurrent callers.
    pub fetches: usize,
    /// Concurrent callers that received a result.
    pub served: usize,
    /// Fetcher counters after the concurrent round.
    pub stats: CacheStats,
}

/// Run the cache-demo command.
pub async fn run() -> Result<Report> {
    let params = json!({ "lat": 52.37, "lng": 4.89, "radius": 500 });
    let policy = CachePolicy::default()
        .with_ttl(Duration::from_millis(5_000))
        .with_debounce(Duration::from_millis(1_000));

    println!("=== cache-demo: ttl 5000ms, debounce 1000ms ===");
    println!();

    let clock = ManualClock::new(Timestamp::zero());
    let mut cache: CacheCoordinator<Value, ManualClock> =
        CacheCoordinator::with_clock(clock.clone());
    cache.register_policy(NAMESPACE, policy.clone());

    let mut timeline = Vec::new();
    for at in [0, 100, 6_000] {
        clock.set(Timestamp::from_millis(at));
        let decision = cache.request_gate(NAMESPACE, OPERATION, &params, None)?;
        let name = label(&decision);
        println!("  t={at:>5}ms  gate -> {name}");
        timeline.push((at, name));

        if decision.is_issue() {
            clock.set(Timestamp::from_millis(at + 10));
            cache.commit(NAMESPACE, OPERATION, &params, json!(["cafe", "bakery"]), None)?;
            println!("  t={:>5}ms  commit", at + 10);
        }
    }

    println!();
    println!("  {CONCURRENT_CALLERS} concurrent callers, one fetch:");

    let fetcher: CachedFetcher<Value> = CachedFetcher::default();
    fetcher.register_policy(NAMESPACE, policy);
    let fetches = Arc::new(AtomicUsize::new(0));

    let callers = (0..CONCURRENT_CALLERS).map(|_| {
        let fetcher = fetcher.clone();
        let fetches = Arc::clone(&fetches);
        let params = params.clone();
        async move {
            fetcher
                .get_or_fetch(NAMESPACE, OPERATION, &params, None, move || {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async {
                        sleep(Duration::from_millis(50)).await;
                        Ok::<_, FetchError>(json!(["cafe", "bakery"]))
                    }
                })
                .await
        }
    });
    let results = join_all(callers).await;

    let served = results
        .iter()
        .filter(|result| matches!(result, Ok(Some(_))))
        .count();
    let report = Report {
        timeline,
        fetches: fetches.load(Ordering::SeqCst),
        served,
        stats: fetcher.stats(),
    };

    println!("  fetches:     {}", report.fetches);
    println!("  served:      {}", report.served);
    println!("  dedup waits: {}", report.stats.dedup_waits);

    Ok(report)
}

fn label<T>(decision: &Decision<T>) -> &'static str {
    match decision {
        Decision::Issue => "issue",
        Decision::UseCache(_) => "use-cache",
        Decision::AwaitPending(_) => "await-pending",
        Decision::Suppress => "suppress",
    }
}
