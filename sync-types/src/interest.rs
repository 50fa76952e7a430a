//! Interest sets for live subscriptions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::TopicId;

/// The topics a live subscription filters events by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterestSet {
    /// Only events for these topics.
    Topics(BTreeSet<TopicId>),
    /// Everything the backend is willing to deliver.
    Wildcard,
}

impl InterestSet {
    /// Build an interest set from topics, falling back to [`InterestSet::Wildcard`]
    /// when there are none so a channel still delivers something useful.
    pub fn from_topics_or_wildcard(topics: BTreeSet<TopicId>) -> Self {
        if topics.is_empty() {
            Self::Wildcard
        } else {
            Self::Topics(topics)
        }
    }

    /// Whether events for `topic` pass this filter.
    pub fn covers(&self, topic: &TopicId) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Topics(topics) => topics.contains(topic),
        }
    }

    /// Whether this is the wildcard set.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }

    /// Add a topic in place.
    ///
    /// Returns `true` if the filter was enlarged. Wildcard sets are never changed.
    pub fn insert(&mut self, topic: TopicId) -> bool {
        match self {
            Self::Wildcard => false,
            Self::Topics(topics) => topics.insert(topic),
        }
    }

    /// Number of explicit topics (`None` for wildcard).
    pub fn topic_count(&self) -> Option<usize> {
        match self {
            Self::Wildcard => None,
            Self::Topics(topics) => Some(topics.len()),
        }
    }
}

impl Default for InterestSet {
    fn default() -> Self {
        Self::Wildcard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(ids: &[&str]) -> BTreeSet<TopicId> {
        ids.iter().map(|id| TopicId::new(*id)).collect()
    }

    #[test]
    fn empty_topics_become_wildcard() {
        let set = InterestSet::from_topics_or_wildcard(BTreeSet::new());
        assert!(set.is_wildcard());
    }

    #[test]
    fn wildcard_covers_everything() {
        assert!(InterestSet::Wildcard.covers(&TopicId::new("anything")));
    }

    #[test]
    fn explicit_set_covers_only_members() {
        let set = InterestSet::from_topics_or_wildcard(topics(&["a", "b"]));
        assert!(set.covers(&TopicId::new("a")));
        assert!(!set.covers(&TopicId::new("c")));
    }

    #[test]
    fn insert_enlarges_explicit_set() {
        let mut set = InterestSet::from_topics_or_wildcard(topics(&["a"]));
        assert!(set.insert(TopicId::new("b")));
        assert!(!set.insert(TopicId::new("b")));
        assert_eq!(set.topic_count(), Some(2));
    }

    #[test]
    fn insert_into_wildcard_is_noop() {
        let mut set = InterestSet::Wildcard;
        assert!(!set.insert(TopicId::new("a")));
        assert!(set.is_wildcard());
    }
}
