//! Cache & deduplication coordinator.
//!
//! Decides, before any network fetch, whether a caller should issue a new
//! fetch, reuse a cached result, await a fetch already in flight, or do
//! nothing at all. The coordinator never performs fetches itself.
//!
//! ```text
//! caller ──request_gate──▶ Decision::Issue ──attach_pending──▶ fetch ──commit
//!                      ├─▶ Decision::UseCache(data)
//!                      ├─▶ Decision::AwaitPending(shared future)
//!                      └─▶ Decision::Suppress
//! ```

mod coordinator;
mod error;
mod fingerprint;
mod policy;

pub use coordinator::{
    CacheCoordinator, CacheEntry, CacheStats, Decision, PendingFetch, PendingTicket,
    DEFAULT_PENDING_TIMEOUT, ENTRY_FORMAT_VERSION,
};
pub use error::{CacheError, FetchError};
pub use fingerprint::Fingerprint;
pub use policy::CachePolicy;
