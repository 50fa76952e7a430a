//! Transport abstraction for the live update channel.
//!
//! The subscription manager never speaks a backend wire protocol. It asks a
//! [`ChannelFactory`] for a [`Channel`] filtered by an interest set and reads
//! everything the transport has to say from the [`ChannelEvents`] sender it
//! handed over.
//!
//! # Design
//!
//! - `open()` starts a subscription; success is confirmed later by a
//!   [`ChannelStatus::Subscribed`] event, not by `open()` returning
//! - `publish()` broadcasts an event on the channel
//! - `close()` releases the channel
//!
//! # Example
//!
//! ```ignore
//! let factory = MockChannelFactory::new();
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let channel = factory.open(request, tx).await?;
//! channel.publish("typing", serde_json::json!({"user": "ana"})).await?;
//! ```

mod mock;

pub use mock::{MockChannel, MockChannelFactory, OpenBehavior};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tidal_sync_types::{InterestSet, LiveMessage, SessionId};
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The channel could not be opened.
    #[error("channel open failed: {0}")]
    OpenFailed(String),

    /// The channel is closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Publish failed.
    #[error("publish failed: {0}")]
    PublishFailed(String),
}

/// Status reported by a transport for an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The backend confirmed the subscription.
    Subscribed,
    /// The channel failed.
    Error(String),
    /// The backend did not confirm in time.
    TimedOut,
    /// The channel was closed.
    Closed,
}

/// Something a transport reports about a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A lifecycle status change.
    Status(ChannelStatus),
    /// A pushed record change, in server emission order.
    Message(LiveMessage),
}

/// Where a transport sends [`ChannelEvent`]s for the channel it opened.
pub type ChannelEvents = mpsc::UnboundedSender<ChannelEvent>;

/// What a channel should be opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// The session the channel belongs to.
    pub session: SessionId,
    /// Topics the channel filters on.
    pub interest: InterestSet,
}

/// An open live channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Broadcast an event on this channel.
    async fn publish(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Release the channel.
    async fn close(&self);

    /// The subscription's filter was enlarged in place.
    ///
    /// Transports that accept a larger filter without resubscribing apply it
    /// here; the default does nothing.
    fn interest_changed(&self, _interest: &InterestSet) {}
}

/// Opens live channels.
///
/// Implementations handle the underlying connection mechanism (websocket,
/// server-sent events, mock, etc).
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Open a channel and report its status and messages through `events`.
    async fn open(
        &self,
        request: ChannelRequest,
        events: ChannelEvents,
    ) -> Result<Arc<dyn Channel>, TransportError>;
}
