//! Update-source collaborator: interest queries and poll-since queries.
//!
//! The subscription manager asks the source which topics a session cares
//! about before opening a channel, and polls it for newer records while the
//! live channel is down.

use crate::lock::mutex_lock;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tidal_sync_types::{InterestSet, Record, SessionId, Timestamp, TopicId};

/// Update source errors.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The backend query failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The backend could not be reached.
    #[error("source unavailable")]
    Unavailable,
}

/// Backend queries used by the subscription manager.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Topics the session participates in.
    async fn interest_for(&self, session: &SessionId) -> Result<BTreeSet<TopicId>, SourceError>;

    /// Records covered by `interest` that changed after `since`.
    async fn poll_since(
        &self,
        interest: &InterestSet,
        since: Timestamp,
    ) -> Result<Vec<Record>, SourceError>;
}

/// In-memory update source for testing.
///
/// Serves a fixed topic list and returns stored records newer than the poll
/// cursor. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockUpdateSource {
    inner: Arc<Mutex<MockSourceInner>>,
}

#[derive(Debug, Default)]
struct MockSourceInner {
    topics: BTreeSet<TopicId>,
    records: Vec<Record>,
    polls: Vec<(InterestSet, Timestamp)>,
    fail_interest: Option<String>,
    fail_next_poll: Option<String>,
}

impl MockUpdateSource {
    /// Create a source with no topics and no records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics returned by `interest_for`.
    pub fn set_topics<I, T>(&self, topics: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<TopicId>,
    {
        let mut inner = mutex_lock(&self.inner, "source::mock", "set_topics");
        inner.topics = topics.into_iter().map(Into::into).collect();
    }

    /// Make `interest_for` fail until cleared with `None`.
    pub fn fail_interest(&self, error: Option<&str>) {
        let mut inner = mutex_lock(&self.inner, "source::mock", "fail_interest");
        inner.fail_interest = error.map(str::to_string);
    }

    /// Cause the next `poll_since()` to fail with the given error.
    pub fn fail_next_poll(&self, error: &str) {
        let mut inner = mutex_lock(&self.inner, "source::mock", "fail_next_poll");
        inner.fail_next_poll = Some(error.to_string());
    }

    /// Store a record for later polls.
    pub fn add_record(&self, record: Record) {
        mutex_lock(&self.inner, "source::mock", "add_record")
            .records
            .push(record);
    }

    /// Every `(interest, since)` pair passed to `poll_since()`.
    pub fn polls(&self) -> Vec<(InterestSet, Timestamp)> {
        mutex_lock(&self.inner, "source::mock", "polls")
            .polls
            .clone()
    }

    /// Number of `poll_since()` calls so far.
    pub fn poll_count(&self) -> usize {
        mutex_lock(&self.inner, "source::mock", "poll_count")
            .polls
            .len()
    }
}

#[async_trait]
impl UpdateSource for MockUpdateSource {
    async fn interest_for(&self, _session: &SessionId) -> Result<BTreeSet<TopicId>, SourceError> {
        let inner = mutex_lock(&self.inner, "source::mock", "interest_for");
        match &inner.fail_interest {
            Some(error) => Err(SourceError::QueryFailed(error.clone())),
            None => Ok(inner.topics.clone()),
        }
    }

    async fn poll_since(
        &self,
        interest: &InterestSet,
        since: Timestamp,
    ) -> Result<Vec<Record>, SourceError> {
        let mut inner = mutex_lock(&self.inner, "source::mock", "poll_since");
        inner.polls.push((interest.clone(), since));

        if let Some(error) = inner.fail_next_poll.take() {
            return Err(SourceError::QueryFailed(error));
        }

        Ok(inner
            .records
            .iter()
            .filter(|record| record.timestamp > since && interest.covers(&record.topic))
            .cloned()
            .collect())
    }
}
