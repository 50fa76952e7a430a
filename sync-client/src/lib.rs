//! # sync-client
//!
//! Client runtime for tidal-sync.
//!
//! Applications use this crate to keep a live update channel open and to
//! deduplicate expensive fetches.
//!
//! ## Features
//!
//! - **Live subscriptions**: one channel per session, heartbeats, idle sweep
//! - **Reconnect**: capped exponential backoff with a hard attempt limit
//! - **Fallback polling**: poll-since queries while the channel is down
//! - **Cached fetching**: single-flight fetches over the sync-core coordinator
//! - **Transport Abstraction**: pluggable channel transport (mock included)
//! - **Pure State Machine**: Uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidal_sync_client::{MockChannelFactory, MockUpdateSource, RealtimeConfig, SubscriptionManager};
//!
//! let manager = SubscriptionManager::new(
//!     Arc::new(MockChannelFactory::new()),
//!     Arc::new(MockUpdateSource::new()),
//!     RealtimeConfig::default(),
//! );
//! manager.add_message_listener(|msg| println!("{} changed", msg.record.id));
//! manager.initialize("user-42".into());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod fetcher;
pub mod listeners;
mod lock;
pub mod manager;
mod poller;
pub mod source;
mod timers;
pub mod transport;

pub use config::{Config, ConfigError, RealtimeConfig};
pub use fetcher::{spawn_sweep_task, CachedFetcher, FetcherError};
pub use listeners::ListenerId;
pub use manager::{
    DebugInfo, ManagerStats, MessageListener, StatusListener, SubscriptionInfo,
    SubscriptionManager, HEARTBEAT_EVENT,
};
pub use source::{MockUpdateSource, SourceError, UpdateSource};
pub use transport::{
    Channel, ChannelEvent, ChannelEvents, ChannelFactory, ChannelRequest, ChannelStatus,
    MockChannel, MockChannelFactory, OpenBehavior, TransportError,
};
