//! Per-project event fan-out.
//!
//! Emission is fire-and-forget: a subscriber that went away is pruned on the
//! next emit, never reported as an error to the emitting operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;

use crate::store::{ChangesetStatus, LoopStatus};

/// Everything the kernel announces about changesets and build loops.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEvent {
    ChangesetProposed {
        changeset_id: i64,
        summary: String,
        files: usize,
    },
    ChangesetApplied {
        changeset_id: i64,
        /// Set when the workspace commit landed but a nested sub-repository
        /// commit failed; the changeset is still applied.
        nested_commit_error: Option<String>,
    },
    ChangesetBlocked {
        changeset_id: i64,
        reason: String,
    },
    ChangesetRejected {
        changeset_id: i64,
        reason: String,
    },
    ChangesetRebuilt {
        changeset_id: i64,
        /// Child id when the rebuild branched instead of replacing.
        branched_to: Option<i64>,
        status: ChangesetStatus,
    },
    LoopStarted {
        loop_id: i64,
        max_iterations: usize,
    },
    LoopIteration {
        loop_id: i64,
        iteration: usize,
        exit_code: Option<i32>,
    },
    LoopSucceeded {
        loop_id: i64,
        iterations: usize,
    },
    LoopFailed {
        loop_id: i64,
        iterations: usize,
    },
    LoopBlocked {
        loop_id: i64,
        reason: String,
    },
}

impl KernelEvent {
    /// Loop status implied by a terminal loop event, if any.
    pub fn loop_status(&self) -> Option<LoopStatus> {
        match self {
            Self::LoopSucceeded { .. } => Some(LoopStatus::Success),
            Self::LoopFailed { .. } => Some(LoopStatus::Failed),
            Self::LoopBlocked { .. } => Some(LoopStatus::Blocked),
            _ => None,
        }
    }
}

struct SubscriberSlot {
    id: u64,
    sender: Sender<KernelEvent>,
}

#[derive(Default)]
struct BusInner {
    next_subscriber: u64,
    by_project: HashMap<i64, Vec<SubscriberSlot>>,
}

/// Fan-out hub, cheap to clone and share across threads.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Subscribe to one project's events. The subscription unsubscribes
    /// itself on drop.
    pub fn subscribe(&self, project_id: i64) -> Subscription {
        let (sender, receiver) = unbounded();
        let mut inner = self.lock();
        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        inner
            .by_project
            .entry(project_id)
            .or_default()
            .push(SubscriberSlot { id, sender });
        Subscription {
            bus: self.clone(),
            project_id,
            id,
            receiver,
        }
    }

    /// Deliver `event` to every live subscriber of `project_id`, pruning
    /// subscribers whose receiving end is gone.
    pub fn emit(&self, project_id: i64, event: &KernelEvent) {
        let mut inner = self.lock();
        let Some(slots) = inner.by_project.get_mut(&project_id) else {
            return;
        };
        slots.retain(|slot| slot.sender.send(event.clone()).is_ok());
        if slots.is_empty() {
            inner.by_project.remove(&project_id);
        }
    }

    fn unsubscribe(&self, project_id: i64, id: u64) {
        let mut inner = self.lock();
        if let Some(slots) = inner.by_project.get_mut(&project_id) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                inner.by_project.remove(&project_id);
            }
        }
    }
}

/// One subscriber's end of the bus.
pub struct Subscription {
    bus: EventBus,
    project_id: i64,
    id: u64,
    receiver: Receiver<KernelEvent>,
}

impl Subscription {
    /// Next event, if one is already queued.
    pub fn try_next(&self) -> Option<KernelEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<KernelEvent> {
        self.receiver.try_iter().collect()
    }

    /// Detach from the bus now instead of waiting for drop.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.project_id, self.id);
    }
}

impl Iterator for &Subscription {
    type Item = KernelEvent;

    fn next(&mut self) -> Option<KernelEvent> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_only_their_project() {
        let bus = EventBus::new();
        let sub_a = bus.subscribe(1);
        let sub_b = bus.subscribe(2);

        bus.emit(
            1,
            &KernelEvent::LoopStarted {
                loop_id: 7,
                max_iterations: 5,
            },
        );

        assert_eq!(sub_a.drain().len(), 1);
        assert!(sub_b.try_next().is_none());
    }

    #[test]
    fn dropped_subscription_is_pruned_not_an_error() {
        let bus = EventBus::new();
        let kept = bus.subscribe(1);
        drop(bus.subscribe(1));

        bus.emit(
            1,
            &KernelEvent::ChangesetRejected {
                changeset_id: 3,
                reason: "superseded".to_string(),
            },
        );
        assert_eq!(kept.drain().len(), 1);
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let value = serde_json::to_value(KernelEvent::ChangesetApplied {
            changeset_id: 9,
            nested_commit_error: None,
        })
        .expect("json");
        assert_eq!(value["event"], "changeset_applied");
        assert_eq!(value["changeset_id"], 9);
    }
}
