//! Mock channel transport for testing.
//!
//! Allows scripting how opens behave, injecting pushed messages and status
//! changes, and capturing published events for verification.

use super::{
    Channel, ChannelEvent, ChannelEvents, ChannelFactory, ChannelRequest, ChannelStatus,
    TransportError,
};
use crate::lock::mutex_lock;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tidal_sync_types::{InterestSet, LiveMessage};

/// How [`MockChannelFactory::open`] behaves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OpenBehavior {
    /// Open succeeds and `Subscribed` is reported right away.
    #[default]
    Subscribe,
    /// `open()` itself returns an error.
    Fail(String),
    /// Open succeeds but the transport reports an error status.
    ReportError(String),
    /// Open succeeds and nothing is reported (the attempt will time out).
    Silent,
}

/// Mock channel factory for testing.
///
/// Clones share state, so a test can keep one handle while the manager owns another.
#[derive(Debug, Clone, Default)]
pub struct MockChannelFactory {
    inner: Arc<Mutex<MockFactoryInner>>,
}

#[derive(Debug, Default)]
struct MockFactoryInner {
    behavior: OpenBehavior,
    fail_next_open: Option<String>,
    requests: Vec<ChannelRequest>,
    channels: Vec<MockChannel>,
}

impl MockChannelFactory {
    /// Create a factory whose opens succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how every following open behaves.
    pub fn set_open_behavior(&self, behavior: OpenBehavior) {
        let mut inner = mutex_lock(&self.inner, "transport::mock", "set_open_behavior");
        inner.behavior = behavior;
    }

    /// Cause the next `open()` to fail with the given error.
    pub fn fail_next_open(&self, error: &str) {
        let mut inner = mutex_lock(&self.inner, "transport::mock", "fail_next_open");
        inner.fail_next_open = Some(error.to_string());
    }

    /// Number of `open()` calls so far, failed ones included.
    pub fn open_count(&self) -> usize {
        mutex_lock(&self.inner, "transport::mock", "open_count")
            .requests
            .len()
    }

    /// Every request passed to `open()`.
    pub fn requests(&self) -> Vec<ChannelRequest> {
        mutex_lock(&self.inner, "transport::mock", "requests")
            .requests
            .clone()
    }

    /// Channels handed out so far.
    pub fn channels(&self) -> Vec<MockChannel> {
        mutex_lock(&self.inner, "transport::mock", "channels")
            .channels
            .clone()
    }

    /// The most recently opened channel.
    pub fn latest_channel(&self) -> Option<MockChannel> {
        mutex_lock(&self.inner, "transport::mock", "latest_channel")
            .channels
            .last()
            .cloned()
    }

    /// Clear all state.
    pub fn reset(&self) {
        let mut inner = mutex_lock(&self.inner, "transport::mock", "reset");
        *inner = MockFactoryInner::default();
    }
}

#[async_trait]
impl ChannelFactory for MockChannelFactory {
    async fn open(
        &self,
        request: ChannelRequest,
        events: ChannelEvents,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        let mut inner = mutex_lock(&self.inner, "transport::mock", "open");
        inner.requests.push(request.clone());

        // Check for forced failure
        if let Some(error) = inner.fail_next_open.take() {
            return Err(TransportError::OpenFailed(error));
        }

        let initial_status = match &inner.behavior {
            OpenBehavior::Fail(error) => return Err(TransportError::OpenFailed(error.clone())),
            OpenBehavior::Subscribe => Some(ChannelStatus::Subscribed),
            OpenBehavior::ReportError(error) => Some(ChannelStatus::Error(error.clone())),
            OpenBehavior::Silent => None,
        };

        let channel = MockChannel::new(request, events);
        if let Some(status) = initial_status {
            channel.report_status(status);
        }
        inner.channels.push(channel.clone());
        Ok(Arc::new(channel))
    }
}

/// A channel handed out by [`MockChannelFactory`].
#[derive(Debug, Clone)]
pub struct MockChannel {
    inner: Arc<Mutex<MockChannelInner>>,
}

#[derive(Debug)]
struct MockChannelInner {
    request: ChannelRequest,
    interest: InterestSet,
    /// Dropped on close, ending the receiver's stream like a real transport.
    events: Option<ChannelEvents>,
    published: Vec<(String, Value)>,
    closed: bool,
    fail_next_publish: Option<String>,
}

impl MockChannel {
    fn new(request: ChannelRequest, events: ChannelEvents) -> Self {
        let interest = request.interest.clone();
        Self {
            inner: Arc::new(Mutex::new(MockChannelInner {
                request,
                interest,
                events: Some(events),
                published: Vec::new(),
                closed: false,
                fail_next_publish: None,
            })),
        }
    }

    /// The request this channel was opened for.
    pub fn request(&self) -> ChannelRequest {
        mutex_lock(&self.inner, "transport::mock", "request")
            .request
            .clone()
    }

    /// Current filter, including in-place enlargements.
    pub fn interest(&self) -> InterestSet {
        mutex_lock(&self.inner, "transport::mock", "interest")
            .interest
            .clone()
    }

    /// Every `(event, payload)` published on this channel.
    pub fn published(&self) -> Vec<(String, Value)> {
        mutex_lock(&self.inner, "transport::mock", "published")
            .published
            .clone()
    }

    /// Published events with the given name.
    pub fn published_named(&self, event: &str) -> usize {
        mutex_lock(&self.inner, "transport::mock", "published_named")
            .published
            .iter()
            .filter(|(name, _)| name == event)
            .count()
    }

    /// Whether `close()` was called.
    pub fn is_closed(&self) -> bool {
        mutex_lock(&self.inner, "transport::mock", "is_closed").closed
    }

    /// Cause the next `publish()` to fail with the given error.
    pub fn fail_next_publish(&self, error: &str) {
        let mut inner = mutex_lock(&self.inner, "transport::mock", "fail_next_publish");
        inner.fail_next_publish = Some(error.to_string());
    }

    /// Report a status change as the transport would.
    ///
    /// Returns `false` if the receiving side is gone.
    pub fn report_status(&self, status: ChannelStatus) -> bool {
        self.emit(ChannelEvent::Status(status))
    }

    /// Push a record change as the transport would.
    ///
    /// Returns `false` if the receiving side is gone.
    pub fn push_message(&self, message: LiveMessage) -> bool {
        self.emit(ChannelEvent::Message(message))
    }

    fn emit(&self, event: ChannelEvent) -> bool {
        mutex_lock(&self.inner, "transport::mock", "emit")
            .events
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        let mut inner = mutex_lock(&self.inner, "transport::mock", "publish");

        if inner.closed {
            return Err(TransportError::ChannelClosed);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_publish.take() {
            return Err(TransportError::PublishFailed(error));
        }

        inner.published.push((event.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        let mut inner = mutex_lock(&self.inner, "transport::mock", "close");
        inner.closed = true;
        inner.events = None;
    }

    fn interest_changed(&self, interest: &InterestSet) {
        mutex_lock(&self.inner, "transport::mock", "interest_changed").interest = interest.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidal_sync_types::{ChangeKind, Record, SessionId, Timestamp, TopicId};
    use tokio::sync::mpsc;

    fn request() -> ChannelRequest {
        ChannelRequest {
            session: SessionId::new("session-1"),
            interest: InterestSet::Wildcard,
        }
    }

    // ===========================================
    // MockChannelFactory Tests
    // ===========================================

    #[tokio::test]
    async fn open_reports_subscribed() {
        let factory = MockChannelFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        factory.open(request(), tx).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ChannelEvent::Status(ChannelStatus::Subscribed))
        );
        assert_eq!(factory.open_count(), 1);
        assert_eq!(factory.requests()[0].session, SessionId::new("session-1"));
    }

    #[tokio::test]
    async fn forced_open_failure_is_one_shot() {
        let factory = MockChannelFactory::new();
        factory.fail_next_open("network unreachable");

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = factory.open(request(), tx.clone()).await;
        assert!(matches!(result, Err(TransportError::OpenFailed(_))));

        assert!(factory.open(request(), tx).await.is_ok());
        assert_eq!(factory.open_count(), 2);
        assert_eq!(factory.channels().len(), 1);
    }

    #[tokio::test]
    async fn persistent_failure_behavior() {
        let factory = MockChannelFactory::new();
        factory.set_open_behavior(OpenBehavior::Fail("down".into()));

        for _ in 0..3 {
            let (tx, _rx) = mpsc::unbounded_channel();
            assert!(factory.open(request(), tx).await.is_err());
        }
        assert_eq!(factory.open_count(), 3);
    }

    #[tokio::test]
    async fn report_error_behavior() {
        let factory = MockChannelFactory::new();
        factory.set_open_behavior(OpenBehavior::ReportError("rejected".into()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        factory.open(request(), tx).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ChannelEvent::Status(ChannelStatus::Error("rejected".into())))
        );
    }

    #[tokio::test]
    async fn silent_behavior_reports_nothing() {
        let factory = MockChannelFactory::new();
        factory.set_open_behavior(OpenBehavior::Silent);
        let (tx, mut rx) = mpsc::unbounded_channel();

        factory.open(request(), tx).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    // ===========================================
    // MockChannel Tests
    // ===========================================

    #[tokio::test]
    async fn channel_captures_published_events() {
        let factory = MockChannelFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = factory.open(request(), tx).await.unwrap();

        channel.publish("typing", json!({"user": "ana"})).await.unwrap();
        channel.publish("heartbeat", json!({})).await.unwrap();

        let mock = factory.latest_channel().unwrap();
        assert_eq!(mock.published().len(), 2);
        assert_eq!(mock.published_named("heartbeat"), 1);
        assert_eq!(mock.published()[0].0, "typing");
    }

    #[tokio::test]
    async fn forced_publish_failure() {
        let factory = MockChannelFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = factory.open(request(), tx).await.unwrap();
        factory.latest_channel().unwrap().fail_next_publish("buffer full");

        let result = channel.publish("e", json!(1)).await;
        assert!(matches!(result, Err(TransportError::PublishFailed(_))));

        // Next publish should work
        channel.publish("e", json!(2)).await.unwrap();
    }

    #[tokio::test]
    async fn closed_channel_rejects_publish() {
        let factory = MockChannelFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = factory.open(request(), tx).await.unwrap();

        channel.close().await;

        assert!(factory.latest_channel().unwrap().is_closed());
        let result = channel.publish("e", json!(null)).await;
        assert!(matches!(result, Err(TransportError::ChannelClosed)));
    }

    #[tokio::test]
    async fn close_ends_the_event_stream() {
        let factory = MockChannelFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = factory.open(request(), tx).await.unwrap();
        let _subscribed = rx.recv().await;

        channel.close().await;

        assert_eq!(rx.recv().await, None);
        assert!(!factory
            .latest_channel()
            .unwrap()
            .report_status(ChannelStatus::Closed));
    }

    #[tokio::test]
    async fn pushed_messages_reach_receiver() {
        let factory = MockChannelFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        factory.open(request(), tx).await.unwrap();
        let _subscribed = rx.recv().await;

        let record = Record::new("r1", "t1", json!({"n": 1}), Timestamp::from_millis(5));
        let message = LiveMessage::new(ChangeKind::Insert, record);
        assert!(factory.latest_channel().unwrap().push_message(message.clone()));

        assert_eq!(rx.recv().await, Some(ChannelEvent::Message(message)));
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_returns_false() {
        let factory = MockChannelFactory::new();
        let (tx, rx) = mpsc::unbounded_channel();
        factory.open(request(), tx).await.unwrap();
        drop(rx);

        assert!(!factory
            .latest_channel()
            .unwrap()
            .report_status(ChannelStatus::Closed));
    }

    #[tokio::test]
    async fn interest_changes_are_recorded() {
        let factory = MockChannelFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = factory
            .open(
                ChannelRequest {
                    session: SessionId::new("s"),
                    interest: InterestSet::Topics([TopicId::new("a")].into()),
                },
                tx,
            )
            .await
            .unwrap();

        let enlarged = InterestSet::Topics([TopicId::new("a"), TopicId::new("b")].into());
        channel.interest_changed(&enlarged);

        assert_eq!(factory.latest_channel().unwrap().interest(), enlarged);
    }

    #[tokio::test]
    async fn factory_clone_shares_state() {
        let factory1 = MockChannelFactory::new();
        let factory2 = factory1.clone();

        let (tx, _rx) = mpsc::unbounded_channel();
        factory1.open(request(), tx).await.unwrap();

        assert_eq!(factory2.open_count(), 1);
        factory2.reset();
        assert_eq!(factory1.open_count(), 0);
    }
}
