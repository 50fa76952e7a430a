//! Records and the live message shape delivered to listeners.
//!
//! Push-delivered and poll-delivered updates are both expressed as a
//! [`LiveMessage`], so downstream consumers cannot tell them apart.

use serde::{Deserialize, Serialize};

use crate::{RecordId, Timestamp, TopicId};

/// A backend record as seen by the sync core.
///
/// The payload is opaque; the core only reads `id`, `topic` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identity (upsert key for consumers).
    pub id: RecordId,
    /// Topic the record belongs to.
    pub topic: TopicId,
    /// Opaque record body.
    pub payload: serde_json::Value,
    /// When the backend created or last modified the record.
    pub timestamp: Timestamp,
}

impl Record {
    /// Create a new record.
    pub fn new(
        id: impl Into<RecordId>,
        topic: impl Into<TopicId>,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            payload,
            timestamp,
        }
    }
}

/// The kind of change a live message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// A new record.
    Insert,
    /// An existing record changed.
    Update,
    /// A record was removed.
    Delete,
}

/// A single update delivered to message listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMessage {
    /// What happened to the record.
    pub kind: ChangeKind,
    /// The record itself.
    pub record: Record,
}

impl LiveMessage {
    /// Create a new message.
    pub fn new(kind: ChangeKind, record: Record) -> Self {
        Self { kind, record }
    }

    /// Topic of the carried record.
    pub fn topic(&self) -> &TopicId {
        &self.record.topic
    }
}
