use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::models::LifecycleEvent;

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1000;
const BROADCAST_CAPACITY: usize = 1024;

/// Fan-out of lifecycle events plus a bounded backlog for late subscribers.
///
/// The backlog is compacted in batches: once it grows past capacity the
/// oldest half is dropped in one go, so it holds between `capacity / 2` and
/// `capacity` events after any publish.
pub struct EventBus {
    log: Mutex<Vec<LifecycleEvent>>,
    capacity: usize,
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            log: Mutex::new(Vec::with_capacity(capacity)),
            capacity: capacity.max(2),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LifecycleEvent>> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let mut log = self.lock();
        log.push(event.clone());
        if log.len() > self.capacity {
            let drop = log.len() / 2;
            log.drain(..drop);
        }
        // Sent under the lock to keep history and live delivery disjoint.
        // No subscribers is not an error: the backlog still has it.
        let _ = self.sender.send(event);
    }

    pub fn history(&self) -> Vec<LifecycleEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Backlog and a live receiver taken under the same lock, so no event
    /// falls between the two or shows up in both.
    pub fn subscribe_with_history(&self) -> (Vec<LifecycleEvent>, broadcast::Receiver<LifecycleEvent>) {
        let log = self.lock();
        (log.clone(), self.sender.subscribe())
    }
}
