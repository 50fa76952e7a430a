//! # sync-core
//!
//! Pure logic for tidal-sync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for the
//! synchronization core without any network access or timers, enabling
//! fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async runtime needed)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! Time is read through the [`Clock`] trait so cache expiry and debounce
//! windows can be driven by a [`ManualClock`] in tests.
//!
//! The actual I/O (channels, timers, polling) is performed by `sync-client`,
//! which interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod cache;
pub mod clock;
pub mod state;

pub use backoff::{reconnect_delay, ReconnectBackoff};
pub use cache::{
    CacheCoordinator, CacheEntry, CacheError, CachePolicy, CacheStats, Decision, FetchError,
    Fingerprint, PendingFetch, PendingTicket, DEFAULT_PENDING_TIMEOUT, ENTRY_FORMAT_VERSION,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use state::{Action, ConnectionState, Event, FailureReason};
