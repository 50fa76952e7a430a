//! One task handle per background purpose.
//!
//! Scheduling a slot aborts whatever task previously occupied it, so repeated
//! `initialize` calls can never leave two heartbeat (or poll, or reconnect)
//! loops running side by side.

use std::collections::HashMap;
use tokio::task::JoinHandle;

/// Background task purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Slot {
    /// Event pump for the current session's channel.
    Session,
    /// Connection-timeout guard.
    ConnectTimeout,
    /// Heartbeat loop.
    Heartbeat,
    /// Idle subscription sweep.
    IdleSweep,
    /// Reconnect delay.
    Reconnect,
    /// Fallback poll loop.
    Poller,
}

impl Slot {
    const ALL: [Slot; 6] = [
        Slot::Session,
        Slot::ConnectTimeout,
        Slot::Heartbeat,
        Slot::IdleSweep,
        Slot::Reconnect,
        Slot::Poller,
    ];
}

/// Owned task handles, aborted on replacement and on drop.
#[derive(Debug, Default)]
pub(crate) struct TimerSlots {
    tasks: HashMap<Slot, JoinHandle<()>>,
}

impl TimerSlots {
    /// Put `task` in `slot`, aborting the previous occupant.
    pub(crate) fn schedule(&mut self, slot: Slot, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(slot, task) {
            previous.abort();
        }
    }

    /// Abort the task in `slot`, if any.
    pub(crate) fn cancel(&mut self, slot: Slot) {
        if let Some(task) = self.tasks.remove(&slot) {
            task.abort();
        }
    }

    /// Abort every task except those in `keep`.
    pub(crate) fn cancel_all_except(&mut self, keep: &[Slot]) {
        for slot in Slot::ALL {
            if !keep.contains(&slot) {
                self.cancel(slot);
            }
        }
    }

    /// Whether `slot` holds a task that has not finished.
    pub(crate) fn is_running(&self, slot: Slot) -> bool {
        self.tasks
            .get(&slot)
            .is_some_and(|task| !task.is_finished())
    }

    /// Slots with unfinished tasks.
    pub(crate) fn running(&self) -> Vec<Slot> {
        Slot::ALL
            .into_iter()
            .filter(|slot| self.is_running(*slot))
            .collect()
    }
}

impl Drop for TimerSlots {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    #[tokio::test]
    async fn schedule_replaces_and_aborts_previous() {
        let mut slots = TimerSlots::default();
        let first = tokio::spawn(pending::<()>());
        let first_abort = first.abort_handle();

        slots.schedule(Slot::Heartbeat, first);
        slots.schedule(Slot::Heartbeat, tokio::spawn(pending::<()>()));
        tokio::task::yield_now().await;

        assert!(first_abort.is_finished());
        assert!(slots.is_running(Slot::Heartbeat));
    }

    #[tokio::test]
    async fn cancel_all_except_keeps_named_slots() {
        let mut slots = TimerSlots::default();
        for slot in Slot::ALL {
            slots.schedule(slot, tokio::spawn(pending::<()>()));
        }

        slots.cancel_all_except(&[Slot::Poller]);
        tokio::task::yield_now().await;

        assert_eq!(slots.running(), vec![Slot::Poller]);
    }

    #[tokio::test]
    async fn drop_aborts_everything() {
        let mut slots = TimerSlots::default();
        let task = tokio::spawn(pending::<()>());
        let handle = task.abort_handle();
        slots.schedule(Slot::Reconnect, task);

        drop(slots);
        tokio::task::yield_now().await;

        assert!(handle.is_finished());
    }
}
