//! Connection state machine for the live update channel.
//!
//! This module provides a pure, side-effect-free state machine for managing
//! the realtime session lifecycle. The state machine takes events as input and
//! produces a new state plus a list of actions to execute.
//!
//! The actual I/O (opening channels, timers, polling) is performed by
//! sync-client, not by this module. This enables instant unit testing without
//! transport mocks.

use std::fmt;

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session, or the session was torn down.
    #[default]
    Disconnected,
    /// A channel open is in progress.
    Connecting,
    /// The transport confirmed the subscription.
    Connected,
    /// The channel dropped unexpectedly; a reconnect is scheduled.
    Reconnecting,
    /// The last attempt failed. Left only by a scheduled reconnect or `force_reconnect`.
    Error,
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // A new session may be requested from any state.
            (_, Event::InitializeRequested) => (
                Self::Connecting,
                vec![
                    Action::TearDown,
                    Action::OpenChannel,
                    Action::StartConnectTimeout,
                ],
            ),

            // From Connecting
            (Self::Connecting, Event::ChannelSubscribed) => (
                Self::Connected,
                vec![
                    Action::CancelConnectTimeout,
                    Action::ResetRetries,
                    Action::StopPoller,
                    Action::StartHeartbeat,
                    Action::StartIdleSweep,
                ],
            ),
            (Self::Connecting, Event::ChannelFailed { reason }) => (
                Self::Error,
                vec![
                    Action::CancelConnectTimeout,
                    Action::RecordFailure(reason),
                    Action::StartPoller,
                    Action::ScheduleReconnect,
                ],
            ),

            // From Connected
            (Self::Connected, Event::ChannelFailed { reason }) => (
                Self::Reconnecting,
                vec![
                    Action::StopHeartbeat,
                    Action::RecordFailure(reason),
                    Action::StartPoller,
                    Action::ScheduleReconnect,
                ],
            ),

            // Backoff gave up
            (Self::Reconnecting | Self::Error, Event::RetriesExhausted) => (
                Self::Error,
                vec![Action::RecordFailure(FailureReason::ExhaustedRetries)],
            ),

            // Explicit teardown
            (Self::Disconnected, Event::TeardownRequested) => (Self::Disconnected, vec![]),
            (_, Event::TeardownRequested) => (
                Self::Disconnected,
                vec![Action::TearDown, Action::StopPoller],
            ),

            // Stale or duplicate reports - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the live channel is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if currently trying to (re)establish the channel.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Whether the fallback poller is allowed to run in this state.
    pub fn allows_polling(&self) -> bool {
        !self.is_connected()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Events that can occur in the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `initialize` (or a reconnect timer) requested a fresh session.
    InitializeRequested,
    /// The transport reported the subscription as established.
    ChannelSubscribed,
    /// The attempt or the live channel failed.
    ChannelFailed {
        /// Why it failed.
        reason: FailureReason,
    },
    /// The backoff scheduler has no retries left.
    RetriesExhausted,
    /// `disconnect_all` / `destroy` was called.
    TeardownRequested,
}

/// Why a connection attempt or live channel failed.
///
/// These are never returned as errors; they are recorded and surfaced through
/// a status transition to [`ConnectionState::Error`] or
/// [`ConnectionState::Reconnecting`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The transport did not confirm the subscription in time.
    ConnectionTimeout,
    /// The transport reported an error status or failed to open the channel.
    ChannelError(String),
    /// The transport closed the channel.
    ChannelClosed,
    /// Reconnect attempts reached the configured maximum.
    ExhaustedRetries,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionTimeout => f.write_str("connection timeout"),
            Self::ChannelError(msg) => write!(f, "channel error: {msg}"),
            Self::ChannelClosed => f.write_str("channel closed"),
            Self::ExhaustedRetries => f.write_str("reconnect attempts exhausted"),
        }
    }
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects. The sync-client interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Release subscriptions, channels and every timer except the fallback poller.
    TearDown,
    /// Query interest and open a channel through the transport.
    OpenChannel,
    /// Arm the connection-timeout guard.
    StartConnectTimeout,
    /// Disarm the connection-timeout guard.
    CancelConnectTimeout,
    /// Reset the reconnect attempt counter.
    ResetRetries,
    /// Start the fallback poller (no-op if running).
    StartPoller,
    /// Stop the fallback poller.
    StopPoller,
    /// Start the heartbeat loop.
    StartHeartbeat,
    /// Stop the heartbeat loop.
    StopHeartbeat,
    /// Start the idle-subscription sweep.
    StartIdleSweep,
    /// Ask the backoff scheduler for the next reconnect.
    ScheduleReconnect,
    /// Remember the failure for stats and debug output.
    RecordFailure(FailureReason),
}
