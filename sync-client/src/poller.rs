//! Fallback poller bookkeeping.
//!
//! While the live channel is down, the manager periodically asks the update
//! source for records newer than a cursor and replays them through the
//! message listeners as if they had been pushed.

use tidal_sync_types::{ChangeKind, LiveMessage, Record, Timestamp};

/// Poller state owned by the subscription manager.
#[derive(Debug, Clone, Default)]
pub(crate) struct PollerState {
    active: bool,
    last_poll_at: Option<Timestamp>,
    generation: u64,
}

impl PollerState {
    /// Mark the poller active.
    ///
    /// Returns the generation the new poll loop must carry, or `None` if a
    /// loop is already running. The cursor starts at `now` the first time
    /// and is kept across restarts so no window is skipped.
    pub(crate) fn start(&mut self, now: Timestamp) -> Option<u64> {
        if self.active {
            return None;
        }
        self.active = true;
        self.generation += 1;
        self.last_poll_at.get_or_insert(now);
        Some(self.generation)
    }

    /// Mark the poller inactive; loops from earlier generations stop at
    /// their next check. Returns whether it was active.
    pub(crate) fn stop(&mut self) -> bool {
        let was_active = self.active;
        self.active = false;
        self.generation += 1;
        was_active
    }

    /// Whether a loop of `generation` may keep going.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.active && self.generation == generation
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn last_poll_at(&self) -> Option<Timestamp> {
        self.last_poll_at
    }

    /// The `since` argument for the next poll.
    pub(crate) fn cursor(&self) -> Timestamp {
        self.last_poll_at.unwrap_or_else(Timestamp::zero)
    }

    /// Turn a poll batch into messages ordered by timestamp and advance the
    /// cursor to the newest one. An empty batch leaves the cursor alone.
    pub(crate) fn absorb(&mut self, mut records: Vec<Record>) -> Vec<LiveMessage> {
        records.sort_by_key(|record| record.timestamp);
        if let Some(newest) = records.last() {
            let cursor = self.cursor().max(newest.timestamp);
            self.last_poll_at = Some(cursor);
        }
        records
            .into_iter()
            .map(|record| LiveMessage::new(ChangeKind::Insert, record))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, at: u64) -> Record {
        Record::new(id, "topic", json!({}), Timestamp::from_millis(at))
    }

    #[test]
    fn start_is_idempotent_while_active() {
        let mut poller = PollerState::default();
        assert!(poller.start(Timestamp::from_millis(100)).is_some());
        assert!(poller.start(Timestamp::from_millis(200)).is_none());
        assert_eq!(poller.cursor(), Timestamp::from_millis(100));
    }

    #[test]
    fn stop_invalidates_running_generation() {
        let mut poller = PollerState::default();
        let generation = poller.start(Timestamp::zero()).unwrap();
        assert!(poller.is_current(generation));

        assert!(poller.stop());
        assert!(!poller.is_current(generation));
        assert!(!poller.stop());
    }

    #[test]
    fn cursor_survives_restart() {
        let mut poller = PollerState::default();
        poller.start(Timestamp::from_millis(10));
        poller.absorb(vec![record("a", 50)]);
        poller.stop();

        poller.start(Timestamp::from_millis(999));
        assert_eq!(poller.cursor(), Timestamp::from_millis(50));
    }

    #[test]
    fn batch_is_sorted_and_cursor_advances_to_newest() {
        let mut poller = PollerState::default();
        poller.start(Timestamp::from_millis(0));

        let messages = poller.absorb(vec![record("c", 30), record("a", 10), record("b", 20)]);

        let ids: Vec<&str> = messages.iter().map(|m| m.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(messages.iter().all(|m| m.kind == ChangeKind::Insert));
        assert_eq!(poller.last_poll_at(), Some(Timestamp::from_millis(30)));
    }

    #[test]
    fn empty_batch_leaves_cursor_unchanged() {
        let mut poller = PollerState::default();
        poller.start(Timestamp::from_millis(42));

        assert!(poller.absorb(Vec::new()).is_empty());
        assert_eq!(poller.last_poll_at(), Some(Timestamp::from_millis(42)));
    }
}
