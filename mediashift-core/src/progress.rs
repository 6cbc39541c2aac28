//! Progress publication.
//!
//! Every long-running operation owns a `ProgressBus` and publishes immutable
//! snapshots to it. Subscribers receive clones over a broadcast channel; a
//! dropped or lagging subscriber never affects the publisher or any other
//! subscriber.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Snapshots behind these locks are only ever replaced whole, so a poisoned
/// lock still holds a consistent value.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct ProgressBus<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> ProgressBus<T> {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        ProgressBus { tx }
    }

    /// Publish a snapshot to all current subscribers.
    ///
    /// Send errors mean nobody is listening right now; that is fine.
    pub fn publish(&self, snapshot: T) {
        let _ = self.tx.send(snapshot);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for ProgressBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
