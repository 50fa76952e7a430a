//! SubscriptionManager - the live update channel and its fallback.
//!
//! This module provides [`SubscriptionManager`], which owns one logical live
//! session: it opens a channel through a [`ChannelFactory`], keeps it healthy
//! with heartbeats and an idle sweep, reconnects with capped exponential
//! backoff, and replaces pushed updates with polling while the channel is
//! unavailable.
//!
//! # Architecture
//!
//! The manager uses the pure state machine from sync-core for lifecycle
//! decisions and interprets the returned actions as I/O on tokio.
//!
//! ```text
//! Application → SubscriptionManager → ChannelFactory / UpdateSource → Network
//!                      ↓
//!          sync-core (ConnectionState::on_event)
//! ```
//!
//! All state sits behind one `std::sync::Mutex` that is never held across an
//! `.await` nor while listeners run. Background tasks hold a `Weak` reference
//! and stop once the manager is dropped. Every teardown bumps an epoch;
//! results carrying an older epoch are discarded.
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new(factory, source, RealtimeConfig::default());
//! manager.add_message_listener(|msg| println!("{:?}", msg.record.id));
//! manager.initialize(SessionId::new("user-42"));
//! ```

use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tidal_sync_core::{
    Action, Clock, ConnectionState, Event, FailureReason, ReconnectBackoff, SystemClock,
};
use tidal_sync_types::{
    InterestSet, LiveMessage, Record, SessionId, SubscriptionId, Timestamp, TopicId,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

use crate::config::RealtimeConfig;
use crate::listeners::{notify_all, ListenerId, ListenerSet};
use crate::lock::mutex_lock;
use crate::poller::PollerState;
use crate::source::UpdateSource;
use crate::timers::{Slot, TimerSlots};
use crate::transport::{Channel, ChannelEvent, ChannelFactory, ChannelRequest, ChannelStatus};

/// Event name used for keep-alive broadcasts.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Callback for connection state changes.
pub type StatusListener = dyn Fn(ConnectionState) + Send + Sync;

/// Callback for live messages, pushed or polled.
pub type MessageListener = dyn Fn(&LiveMessage) + Send + Sync;

/// Counters kept by the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Successful subscriptions.
    pub connects: u64,
    /// Reconnect timers that fired.
    pub reconnect_attempts: u64,
    /// Recorded failures (timeouts, channel errors, exhaustion).
    pub failures: u64,
    /// Messages pushed by the transport.
    pub messages_received: u64,
    /// Messages synthesized by the fallback poller.
    pub messages_polled: u64,
    /// Failed poll queries.
    pub poll_failures: u64,
    /// Successful `send` calls.
    pub messages_sent: u64,
    /// `send` calls whose publish failed.
    pub send_failures: u64,
    /// Heartbeats published.
    pub heartbeats_sent: u64,
    /// Heartbeats whose publish failed.
    pub heartbeat_failures: u64,
    /// Subscriptions torn down by the idle sweep.
    pub idle_closed: u64,
    /// Listener invocations that panicked.
    pub listener_errors: u64,
    /// When the channel last became connected.
    pub last_connected_at: Option<Timestamp>,
}

/// Snapshot of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    /// Subscription identity.
    pub id: SubscriptionId,
    /// Current filter.
    pub interest: InterestSet,
    /// Whether it takes part in send and heartbeat.
    pub is_active: bool,
    /// Time since the last message in either direction.
    pub idle_for: Duration,
}

/// Everything worth looking at when diagnosing the live channel.
#[derive(Debug, Clone)]
pub struct DebugInfo {
    /// Current state.
    pub state: ConnectionState,
    /// Remembered session.
    pub session: Option<SessionId>,
    /// Session epoch; bumped by every teardown.
    pub epoch: u64,
    /// Whether `pause` is in effect.
    pub paused: bool,
    /// Reconnect attempts since the last success.
    pub reconnect_attempt: u32,
    /// Configured attempt limit.
    pub max_retries: u32,
    /// The most recent failure.
    pub last_failure: Option<FailureReason>,
    /// Whether the fallback poller is running.
    pub poller_active: bool,
    /// Fallback poll cursor.
    pub last_poll_at: Option<Timestamp>,
    /// Interest resolved for the current session.
    pub interest: InterestSet,
    /// Live subscriptions.
    pub subscriptions: Vec<SubscriptionInfo>,
    /// Registered status listeners.
    pub status_listeners: usize,
    /// Registered message listeners.
    pub message_listeners: usize,
    /// Background tasks currently running.
    pub running_tasks: Vec<String>,
    /// Active configuration.
    pub config: RealtimeConfig,
    /// Counters.
    pub stats: ManagerStats,
}

struct Subscription {
    id: SubscriptionId,
    interest: InterestSet,
    is_active: bool,
    last_activity_at: Instant,
    channel: Arc<dyn Channel>,
}

struct Inner {
    config: RealtimeConfig,
    state: ConnectionState,
    session: Option<SessionId>,
    extra_topics: BTreeSet<TopicId>,
    interest: InterestSet,
    epoch: u64,
    paused: bool,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    backoff: ReconnectBackoff,
    poller: PollerState,
    timers: TimerSlots,
    last_failure: Option<FailureReason>,
    stats: ManagerStats,
    status_listeners: ListenerSet<StatusListener>,
    message_listeners: ListenerSet<MessageListener>,
}

impl Inner {
    fn new(config: RealtimeConfig) -> Self {
        let backoff =
            ReconnectBackoff::new(config.base_delay(), config.max_delay(), config.max_retries);
        Self {
            config,
            state: ConnectionState::new(),
            session: None,
            extra_topics: BTreeSet::new(),
            interest: InterestSet::Wildcard,
            epoch: 0,
            paused: false,
            subscriptions: HashMap::new(),
            backoff,
            poller: PollerState::default(),
            timers: TimerSlots::default(),
            last_failure: None,
            stats: ManagerStats::default(),
            status_listeners: ListenerSet::default(),
            message_listeners: ListenerSet::default(),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }
}

struct Shared {
    factory: Arc<dyn ChannelFactory>,
    source: Arc<dyn UpdateSource>,
    clock: Arc<dyn Clock>,
    status_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self, op: &'static str) -> MutexGuard<'_, Inner> {
        mutex_lock(&self.inner, "manager", op)
    }
}

/// The realtime subscription and fallback manager.
///
/// Cloning yields another handle to the same manager. Background tasks stop
/// once every handle is dropped.
#[derive(Clone)]
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    /// Create a manager reading the system clock.
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        source: Arc<dyn UpdateSource>,
        config: RealtimeConfig,
    ) -> Self {
        Self::with_clock(factory, source, config, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit clock for poll cursors and stats.
    pub fn with_clock(
        factory: Arc<dyn ChannelFactory>,
        source: Arc<dyn UpdateSource>,
        config: RealtimeConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionState::new());
        Self {
            shared: Arc::new(Shared {
                factory,
                source,
                clock,
                status_tx,
                inner: Mutex::new(Inner::new(config)),
            }),
        }
    }

    /// Start (or restart) the live session.
    ///
    /// Tears down existing subscriptions and timers, resolves the session's
    /// interest, and opens a channel. Returns immediately; progress is
    /// reported through status listeners.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn initialize(&self, session: SessionId) {
        tracing::info!(session = %session, "initializing live session");
        update(&self.shared, |shared, inner| {
            if inner.session.as_ref() != Some(&session) {
                forget_session_interest(inner);
            }
            inner.session = Some(session);
            inner.paused = false;
            inner.backoff.reset();
            transition(shared, inner, Event::InitializeRequested)
        });
    }

    /// Tear everything down and forget the session.
    pub fn disconnect_all(&self) {
        tracing::info!("disconnecting live session");
        update(&self.shared, |shared, inner| {
            inner.session = None;
            forget_session_interest(inner);
            inner.paused = false;
            transition(shared, inner, Event::TeardownRequested)
        });
    }

    /// Make sure events for `topic` are delivered.
    ///
    /// Enlarges the active subscription's filter in place; without an active
    /// subscription this re-initializes the remembered session instead.
    pub fn add_interest(&self, topic: TopicId) {
        update(&self.shared, |shared, inner| {
            inner.extra_topics.insert(topic.clone());

            if let Some(sub) = inner.subscriptions.values_mut().find(|s| s.is_active) {
                if sub.interest.covers(&topic) {
                    return Vec::new();
                }
                sub.interest.insert(topic.clone());
                sub.channel.interest_changed(&sub.interest);
                inner.interest = sub.interest.clone();
                tracing::debug!(topic = %topic, subscription = %sub.id, "enlarged interest in place");
                return Vec::new();
            }

            if inner.session.is_none() {
                tracing::warn!(topic = %topic, "add_interest without a session; ignoring");
                return Vec::new();
            }
            tracing::debug!(topic = %topic, "no active subscription; re-initializing");
            inner.backoff.reset();
            transition(shared, inner, Event::InitializeRequested)
        });
    }

    /// Publish `event` on a subscription covering `topic`.
    ///
    /// Returns `false` when not connected, when no active subscription covers
    /// the topic, or when the transport rejects the publish. Never errors.
    pub async fn send(&self, topic: &TopicId, event: &str, payload: Value) -> bool {
        let target = {
            let inner = self.shared.lock("send");
            if !inner.state.is_connected() {
                tracing::debug!(topic = %topic, state = %inner.state, "send while not connected");
                return false;
            }
            inner
                .subscriptions
                .values()
                .find(|s| s.is_active && s.interest.covers(topic))
                .map(|s| (s.id, Arc::clone(&s.channel)))
        };

        let Some((id, channel)) = target else {
            tracing::debug!(topic = %topic, "no active subscription covers topic");
            return false;
        };

        match channel.publish(event, payload).await {
            Ok(()) => {
                let mut inner = self.shared.lock("send");
                if let Some(sub) = inner.subscriptions.get_mut(&id) {
                    sub.last_activity_at = Instant::now();
                }
                inner.stats.messages_sent += 1;
                true
            }
            Err(e) => {
                tracing::warn!(topic = %topic, event, error = %e, "publish failed");
                self.shared.lock("send").stats.send_failures += 1;
                false
            }
        }
    }

    /// Register a status listener.
    pub fn add_status_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let listener: Arc<StatusListener> = Arc::new(listener);
        self.shared
            .lock("add_status_listener")
            .status_listeners
            .add(listener)
    }

    /// Remove a status listener. Returns `false` if it was not registered.
    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.shared
            .lock("remove_status_listener")
            .status_listeners
            .remove(id)
    }

    /// Register a message listener.
    pub fn add_message_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LiveMessage) + Send + Sync + 'static,
    {
        let listener: Arc<MessageListener> = Arc::new(listener);
        self.shared
            .lock("add_message_listener")
            .message_listeners
            .add(listener)
    }

    /// Remove a message listener. Returns `false` if it was not registered.
    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.shared
            .lock("remove_message_listener")
            .message_listeners
            .remove(id)
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        self.shared.lock("status").state
    }

    /// Receiver that observes every state change.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status_tx.subscribe()
    }

    /// Counters.
    pub fn stats(&self) -> ManagerStats {
        self.shared.lock("stats").stats.clone()
    }

    /// Diagnostic snapshot.
    pub fn debug_info(&self) -> DebugInfo {
        let inner = self.shared.lock("debug_info");
        let now = Instant::now();
        let mut subscriptions: Vec<SubscriptionInfo> = inner
            .subscriptions
            .values()
            .map(|s| SubscriptionInfo {
                id: s.id,
                interest: s.interest.clone(),
                is_active: s.is_active,
                idle_for: now.saturating_duration_since(s.last_activity_at),
            })
            .collect();
        subscriptions.sort_by_key(|s| s.idle_for);

        DebugInfo {
            state: inner.state,
            session: inner.session.clone(),
            epoch: inner.epoch,
            paused: inner.paused,
            reconnect_attempt: inner.backoff.attempt(),
            max_retries: inner.backoff.max_retries(),
            last_failure: inner.last_failure.clone(),
            poller_active: inner.poller.is_active(),
            last_poll_at: inner.poller.last_poll_at(),
            interest: inner.interest.clone(),
            subscriptions,
            status_listeners: inner.status_listeners.len(),
            message_listeners: inner.message_listeners.len(),
            running_tasks: inner
                .timers
                .running()
                .into_iter()
                .map(|slot| format!("{slot:?}"))
                .collect(),
            config: inner.config.clone(),
            stats: inner.stats.clone(),
        }
    }

    /// Change configuration. Running loops pick up new intervals on their
    /// next iteration; backoff limits apply to the next scheduled reconnect.
    pub fn update_config(&self, update: impl FnOnce(&mut RealtimeConfig)) {
        let mut inner = self.shared.lock("update_config");
        update(&mut inner.config);
        let (base, max, retries) = (
            inner.config.base_delay(),
            inner.config.max_delay(),
            inner.config.max_retries,
        );
        inner.backoff.reconfigure(base, max, retries);
        tracing::info!(config = ?inner.config, "realtime configuration updated");
    }

    /// Reset the attempt counter and re-initialize the remembered session.
    pub fn force_reconnect(&self) {
        update(&self.shared, |shared, inner| {
            if inner.session.is_none() {
                tracing::warn!("force_reconnect without a session; ignoring");
                return Vec::new();
            }
            tracing::info!("forcing reconnect");
            inner.backoff.reset();
            transition(shared, inner, Event::InitializeRequested)
        });
    }

    /// Mark subscriptions inactive without releasing their channels.
    pub fn pause(&self) {
        let mut inner = self.shared.lock("pause");
        inner.paused = true;
        for sub in inner.subscriptions.values_mut() {
            sub.is_active = false;
        }
        tracing::info!("live session paused");
    }

    /// Undo `pause`; re-initializes the session unless still connected.
    pub fn resume(&self) {
        update(&self.shared, |shared, inner| {
            inner.paused = false;
            if inner.state.is_connected() {
                for sub in inner.subscriptions.values_mut() {
                    sub.is_active = true;
                    sub.last_activity_at = Instant::now();
                }
                tracing::info!("live session resumed");
                return Vec::new();
            }
            if inner.session.is_none() {
                return Vec::new();
            }
            tracing::info!(state = %inner.state, "resuming live session with re-initialize");
            inner.backoff.reset();
            transition(shared, inner, Event::InitializeRequested)
        });
    }

    /// Disconnect and drop every listener.
    pub fn destroy(&self) {
        self.disconnect_all();
        let mut inner = self.shared.lock("destroy");
        inner.status_listeners.clear();
        inner.message_listeners.clear();
    }
}

/// Run `f` under the lock, then notify status listeners of any state changes
/// once the lock is released.
fn update<F>(shared: &Arc<Shared>, f: F)
where
    F: FnOnce(&Arc<Shared>, &mut Inner) -> Vec<ConnectionState>,
{
    let (changes, listeners) = {
        let mut inner = shared.lock("update");
        let changes = f(shared, &mut inner);
        let listeners = if changes.is_empty() {
            Vec::new()
        } else {
            inner.status_listeners.snapshot()
        };
        (changes, listeners)
    };

    if changes.is_empty() {
        return;
    }
    let mut failures = 0;
    for state in &changes {
        failures += notify_all(&listeners, "status", |listener| listener(*state));
    }
    if failures > 0 {
        shared.lock("update").stats.listener_errors += failures;
    }
}

/// Apply `event` if it still belongs to the current session and the state is
/// one of `allowed`.
/// Drop what was resolved for the previous session, including a poller
/// still filtering by its topics.
fn forget_session_interest(inner: &mut Inner) {
    inner.extra_topics.clear();
    inner.interest = InterestSet::default();
    if inner.poller.stop() {
        tracing::debug!("stopping fallback poller of previous session");
    }
    inner.timers.cancel(Slot::Poller);
}

fn apply_guarded(shared: &Arc<Shared>, epoch: u64, allowed: &[ConnectionState], event: Event) {
    update(shared, |shared, inner| {
        if !inner.is_current(epoch) || !allowed.contains(&inner.state) {
            tracing::debug!(?event, state = %inner.state, "ignoring stale report");
            return Vec::new();
        }
        transition(shared, inner, event)
    });
}

/// Feed `event` (and any follow-up events) through the state machine and
/// execute the resulting actions. Returns every state entered.
fn transition(shared: &Arc<Shared>, inner: &mut Inner, event: Event) -> Vec<ConnectionState> {
    let mut queue = VecDeque::from([event]);
    let mut changes = Vec::new();

    while let Some(event) = queue.pop_front() {
        let previous = inner.state;
        let (next, actions) = previous.on_event(event);
        inner.state = next;

        if next != previous {
            tracing::debug!(from = %previous, to = %next, "connection state changed");
            if next.is_connected() {
                inner.stats.connects += 1;
                inner.stats.last_connected_at = Some(shared.clock.now());
                tracing::info!(epoch = inner.epoch, "live channel connected");
            }
            shared.status_tx.send_replace(next);
            changes.push(next);
        }

        for action in actions {
            if let Some(follow_up) = execute(shared, inner, action) {
                queue.push_back(follow_up);
            }
        }
    }
    changes
}

fn execute(shared: &Arc<Shared>, inner: &mut Inner, action: Action) -> Option<Event> {
    match action {
        Action::TearDown => {
            inner.epoch += 1;
            // The fallback poller survives reconnect attempts.
            inner.timers.cancel_all_except(&[Slot::Poller]);
            for (_, sub) in inner.subscriptions.drain() {
                tracing::debug!(subscription = %sub.id, "closing subscription");
                tokio::spawn(async move { sub.channel.close().await });
            }
        }
        Action::OpenChannel => {
            let Some(session) = inner.session.clone() else {
                tracing::warn!("open requested without a session");
                return Some(Event::ChannelFailed {
                    reason: FailureReason::ChannelError("no session".into()),
                });
            };
            // Detached: an open in flight during teardown completes and is discarded.
            tokio::spawn(open_session(
                Arc::downgrade(shared),
                session,
                inner.extra_topics.clone(),
                inner.epoch,
            ));
        }
        Action::StartConnectTimeout => {
            let weak = Arc::downgrade(shared);
            let epoch = inner.epoch;
            let timeout = inner.config.connection_timeout();
            let task = tokio::spawn(async move {
                sleep(timeout).await;
                if let Some(shared) = weak.upgrade() {
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "connection attempt timed out");
                    apply_guarded(
                        &shared,
                        epoch,
                        &[ConnectionState::Connecting],
                        Event::ChannelFailed {
                            reason: FailureReason::ConnectionTimeout,
                        },
                    );
                }
            });
            inner.timers.schedule(Slot::ConnectTimeout, task);
        }
        Action::CancelConnectTimeout => inner.timers.cancel(Slot::ConnectTimeout),
        Action::ResetRetries => inner.backoff.reset(),
        Action::StartPoller => {
            if inner.state.allows_polling() {
                if let Some(generation) = inner.poller.start(shared.clock.now()) {
                    tracing::info!(
                        since = %inner.poller.cursor(),
                        "live channel unavailable; fallback poller started"
                    );
                    let task = tokio::spawn(poll_loop(Arc::downgrade(shared), generation));
                    inner.timers.schedule(Slot::Poller, task);
                }
            }
        }
        Action::StopPoller => {
            if inner.poller.stop() {
                tracing::info!("fallback poller stopped");
            }
            inner.timers.cancel(Slot::Poller);
        }
        Action::StartHeartbeat => {
            let task = tokio::spawn(heartbeat_loop(Arc::downgrade(shared), inner.epoch));
            inner.timers.schedule(Slot::Heartbeat, task);
        }
        Action::StopHeartbeat => inner.timers.cancel(Slot::Heartbeat),
        Action::StartIdleSweep => {
            let task = tokio::spawn(idle_sweep_loop(Arc::downgrade(shared), inner.epoch));
            inner.timers.schedule(Slot::IdleSweep, task);
        }
        Action::ScheduleReconnect => match inner.backoff.next_delay() {
            Some(delay) => {
                tracing::info!(
                    attempt = inner.backoff.attempt() + 1,
                    max_retries = inner.backoff.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                let weak = Arc::downgrade(shared);
                let epoch = inner.epoch;
                let task = tokio::spawn(async move {
                    sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        reconnect_now(&shared, epoch);
                    }
                });
                inner.timers.schedule(Slot::Reconnect, task);
            }
            None => {
                tracing::warn!(
                    max_retries = inner.backoff.max_retries(),
                    "reconnect attempts exhausted; staying in error state"
                );
                return Some(Event::RetriesExhausted);
            }
        },
        Action::RecordFailure(reason) => {
            tracing::warn!(reason = %reason, state = %inner.state, "live channel failure");
            inner.stats.failures += 1;
            inner.last_failure = Some(reason);
        }
    }
    None
}

fn reconnect_now(shared: &Arc<Shared>, epoch: u64) {
    update(shared, |shared, inner| {
        let retrying = matches!(
            inner.state,
            ConnectionState::Error | ConnectionState::Reconnecting
        );
        if !inner.is_current(epoch) || !retrying {
            return Vec::new();
        }
        inner.backoff.record_attempt();
        inner.stats.reconnect_attempts += 1;
        tracing::info!(attempt = inner.backoff.attempt(), "reconnecting");
        transition(shared, inner, Event::InitializeRequested)
    });
}

/// Resolve interest, open the channel, then hand it to the event pump.
async fn open_session(
    weak: Weak<Shared>,
    session: SessionId,
    extra_topics: BTreeSet<TopicId>,
    epoch: u64,
) {
    let Some((factory, source)) = weak
        .upgrade()
        .map(|shared| (Arc::clone(&shared.factory), Arc::clone(&shared.source)))
    else {
        return;
    };

    let interest = match source.interest_for(&session).await {
        Ok(topics) => {
            let mut interest = InterestSet::from_topics_or_wildcard(topics);
            for topic in extra_topics {
                interest.insert(topic);
            }
            if interest.is_wildcard() {
                tracing::debug!(session = %session, "session has no topics; using wildcard interest");
            }
            interest
        }
        Err(e) => {
            tracing::warn!(session = %session, error = %e, "interest query failed; using wildcard interest");
            InterestSet::Wildcard
        }
    };

    // The fallback poller filters by this even if the open below fails.
    {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut inner = shared.lock("open_session");
        if !inner.is_current(epoch) {
            return;
        }
        inner.interest = interest.clone();
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let request = ChannelRequest {
        session,
        interest: interest.clone(),
    };
    let opened = factory.open(request, tx).await;

    let Some(shared) = weak.upgrade() else {
        if let Ok(channel) = opened {
            channel.close().await;
        }
        return;
    };

    let channel = match opened {
        Ok(channel) => channel,
        Err(e) => {
            apply_guarded(
                &shared,
                epoch,
                &[ConnectionState::Connecting],
                Event::ChannelFailed {
                    reason: FailureReason::ChannelError(e.to_string()),
                },
            );
            return;
        }
    };

    let adopted = {
        let mut inner = shared.lock("open_session");
        if inner.is_current(epoch) {
            let id = SubscriptionId::new();
            let is_active = !inner.paused;
            inner.interest = interest.clone();
            inner.subscriptions.insert(
                id,
                Subscription {
                    id,
                    interest,
                    is_active,
                    last_activity_at: Instant::now(),
                    channel: Arc::clone(&channel),
                },
            );
            let task = tokio::spawn(pump_events(Arc::downgrade(&shared), epoch, id, rx));
            inner.timers.schedule(Slot::Session, task);
            tracing::debug!(subscription = %id, epoch, "channel opened");
            true
        } else {
            false
        }
    };

    if !adopted {
        tracing::debug!(epoch, "discarding channel opened for a superseded session");
        channel.close().await;
    }
}

/// Forward transport events for one subscription until the channel goes away.
async fn pump_events(
    weak: Weak<Shared>,
    epoch: u64,
    id: SubscriptionId,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Status(status) => on_channel_status(&shared, epoch, status),
            ChannelEvent::Message(message) => deliver_pushed(&shared, epoch, id, message),
        }
    }

    let Some(shared) = weak.upgrade() else {
        return;
    };
    update(&shared, |shared, inner| {
        let live = matches!(
            inner.state,
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if !inner.is_current(epoch) || !live {
            return Vec::new();
        }
        // Released by the idle sweep, not lost.
        if !inner.subscriptions.contains_key(&id) {
            tracing::debug!(subscription = %id, "event stream ended for released subscription");
            return Vec::new();
        }
        transition(
            shared,
            inner,
            Event::ChannelFailed {
                reason: FailureReason::ChannelClosed,
            },
        )
    });
}

fn on_channel_status(shared: &Arc<Shared>, epoch: u64, status: ChannelStatus) {
    const LIVE: &[ConnectionState] = &[ConnectionState::Connecting, ConnectionState::Connected];

    match status {
        ChannelStatus::Subscribed => apply_guarded(
            shared,
            epoch,
            &[ConnectionState::Connecting],
            Event::ChannelSubscribed,
        ),
        ChannelStatus::Error(message) => apply_guarded(
            shared,
            epoch,
            LIVE,
            Event::ChannelFailed {
                reason: FailureReason::ChannelError(message),
            },
        ),
        ChannelStatus::TimedOut => apply_guarded(
            shared,
            epoch,
            LIVE,
            Event::ChannelFailed {
                reason: FailureReason::ConnectionTimeout,
            },
        ),
        ChannelStatus::Closed => apply_guarded(
            shared,
            epoch,
            LIVE,
            Event::ChannelFailed {
                reason: FailureReason::ChannelClosed,
            },
        ),
    }
}

fn deliver_pushed(shared: &Arc<Shared>, epoch: u64, id: SubscriptionId, message: LiveMessage) {
    let listeners = {
        let mut inner = shared.lock("deliver_pushed");
        if !inner.is_current(epoch) {
            return;
        }
        if let Some(sub) = inner.subscriptions.get_mut(&id) {
            sub.last_activity_at = Instant::now();
        }
        inner.stats.messages_received += 1;
        inner.message_listeners.snapshot()
    };

    let failures = notify_all(&listeners, "message", |listener| listener(&message));
    if failures > 0 {
        shared.lock("deliver_pushed").stats.listener_errors += failures;
    }
}

async fn poll_loop(weak: Weak<Shared>, generation: u64) {
    loop {
        let (source, interest, since) = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let inner = shared.lock("poll_loop");
            if !inner.poller.is_current(generation) || !inner.state.allows_polling() {
                return;
            }
            (
                Arc::clone(&shared.source),
                inner.interest.clone(),
                inner.poller.cursor(),
            )
        };

        match source.poll_since(&interest, since).await {
            Ok(records) => {
                if let Some(shared) = weak.upgrade() {
                    deliver_polled(&shared, generation, records);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, since = %since, "fallback poll failed");
                if let Some(shared) = weak.upgrade() {
                    shared.lock("poll_loop").stats.poll_failures += 1;
                }
            }
        }

        let interval = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let interval = shared.lock("poll_loop").config.poll_interval();
            interval
        };
        sleep(interval).await;
    }
}

fn deliver_polled(shared: &Arc<Shared>, generation: u64, records: Vec<Record>) {
    let (messages, listeners) = {
        let mut inner = shared.lock("deliver_polled");
        // The channel may have come up while the query was in flight.
        if !inner.poller.is_current(generation) || !inner.state.allows_polling() {
            tracing::debug!(records = records.len(), "discarding poll batch after poller stopped");
            return;
        }
        let messages = inner.poller.absorb(records);
        inner.stats.messages_polled += messages.len() as u64;
        (messages, inner.message_listeners.snapshot())
    };

    if !messages.is_empty() {
        tracing::debug!(count = messages.len(), "dispatching polled records");
    }
    let mut failures = 0;
    for message in &messages {
        failures += notify_all(&listeners, "message", |listener| listener(message));
    }
    if failures > 0 {
        shared.lock("deliver_polled").stats.listener_errors += failures;
    }
}

async fn heartbeat_loop(weak: Weak<Shared>, epoch: u64) {
    loop {
        let interval = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let interval = shared.lock("heartbeat").config.heartbeat_interval();
            interval
        };
        sleep(interval).await;

        let (channels, at) = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let inner = shared.lock("heartbeat");
            if !inner.is_current(epoch) || !inner.state.is_connected() {
                return;
            }
            let channels: Vec<Arc<dyn Channel>> = inner
                .subscriptions
                .values()
                .filter(|s| s.is_active)
                .map(|s| Arc::clone(&s.channel))
                .collect();
            (channels, shared.clock.now())
        };

        let payload = json!({ "at": at.as_millis() });
        let (mut sent, mut failed) = (0, 0);
        for channel in channels {
            match channel.publish(HEARTBEAT_EVENT, payload.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(error = %e, "heartbeat publish failed");
                }
            }
        }

        if let Some(shared) = weak.upgrade() {
            let mut inner = shared.lock("heartbeat");
            inner.stats.heartbeats_sent += sent;
            inner.stats.heartbeat_failures += failed;
        }
    }
}

async fn idle_sweep_loop(weak: Weak<Shared>, epoch: u64) {
    loop {
        let interval = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let interval = shared.lock("idle_sweep").config.idle_sweep_interval();
            interval
        };
        sleep(interval).await;

        let closed = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut inner = shared.lock("idle_sweep");
            if !inner.is_current(epoch) {
                return;
            }
            let max_idle = inner.config.max_idle();
            let now = Instant::now();
            let idle: Vec<SubscriptionId> = inner
                .subscriptions
                .values()
                .filter(|s| now.saturating_duration_since(s.last_activity_at) > max_idle)
                .map(|s| s.id)
                .collect();

            let mut closed = Vec::with_capacity(idle.len());
            for id in idle {
                if let Some(sub) = inner.subscriptions.remove(&id) {
                    tracing::info!(
                        subscription = %id,
                        max_idle_ms = max_idle.as_millis() as u64,
                        "closing idle subscription"
                    );
                    closed.push(sub.channel);
                }
            }
            inner.stats.idle_closed += closed.len() as u64;
            if !closed.is_empty() && inner.subscriptions.is_empty() {
                inner.timers.cancel(Slot::Session);
            }
            closed
        };

        for channel in closed {
            channel.close().await;
        }
    }
}
