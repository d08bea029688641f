//! Observer registrations keyed by stable id.
//!
//! # Responsibilities
//! - Register, replace and remove observers with their interest masks
//! - Publish the union of pollable interest for the poll controller
//! - Hand the dispatcher a consistent snapshot of live registrations
//!
//! # Design Decisions
//! - Re-registering replaces the mask, it never merges
//! - The effective mask is recomputed under the write lock and published on a
//!   `watch` channel, so readers never observe a union from a stale map
//! - Re-registering the same observer instance keeps its delivery queue

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;

use crate::events::observer::{EventObserver, ObserverQueue};
use crate::events::EventMask;
use crate::observability::metrics;

/// One live observer.
pub struct ObserverRegistration {
    pub id: String,
    pub mask: EventMask,
    pub(crate) queue: Arc<ObserverQueue>,
}

/// Registry of observers and their interest masks.
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Arc<ObserverRegistration>>>,
    mask_tx: watch::Sender<EventMask>,
    queue_capacity: usize,
}

impl SubscriptionRegistry {
    /// Create an empty registry whose observers get queues of `queue_capacity`.
    pub fn new(queue_capacity: usize) -> Self {
        let (mask_tx, _) = watch::channel(EventMask::EMPTY);
        Self {
            entries: RwLock::new(HashMap::new()),
            mask_tx,
            queue_capacity,
        }
    }

    /// Register `observer` under `id`, replacing any previous registration.
    ///
    /// Must be called from within a Tokio runtime: a new observer gets its
    /// own delivery task.
    pub fn register(&self, id: impl Into<String>, mask: EventMask, observer: Arc<dyn EventObserver>) {
        let id = id.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let queue = match entries.get(&id) {
            Some(existing) if existing.queue.serves(&observer) && !existing.queue.is_closed() => {
                existing.queue.clone()
            }
            _ => Arc::new(ObserverQueue::spawn(&id, observer, self.queue_capacity)),
        };

        tracing::debug!(observer = %id, mask = ?mask.iter().collect::<Vec<_>>(), "Observer registered");
        entries.insert(id.clone(), Arc::new(ObserverRegistration { id, mask, queue }));
        self.publish(&entries);
    }

    /// Replace the interest mask of an existing registration.
    ///
    /// Returns `false` when no observer is registered under `id`.
    pub fn set_mask(&self, id: &str, mask: EventMask) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(existing) = entries.get(id) else {
            return false;
        };

        let updated = Arc::new(ObserverRegistration {
            id: existing.id.clone(),
            mask,
            queue: existing.queue.clone(),
        });
        entries.insert(id.to_string(), updated);
        self.publish(&entries);
        true
    }

    /// Remove the registration under `id`. Pending events already queued for
    /// it are still delivered.
    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(id).is_some();
        if removed {
            tracing::debug!(observer = %id, "Observer unregistered");
            self.publish(&entries);
        }
        removed
    }

    /// Remove `id` only while it is still registered to `observer`.
    ///
    /// A client that reconnects under its old id replaces the earlier
    /// registration; the earlier connection's cleanup must not remove the new
    /// one.
    pub fn unregister_if(&self, id: &str, observer: &Arc<dyn EventObserver>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.get(id).is_some_and(|reg| reg.queue.serves(observer)) {
            return false;
        }
        entries.remove(id);
        tracing::debug!(observer = %id, "Observer unregistered");
        self.publish(&entries);
        true
    }

    /// Remove `id` only if its observer has gone away. A fresh registration
    /// made under the same id in the meantime is left alone.
    pub(crate) fn prune_closed(&self, id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(id).is_some_and(|reg| reg.queue.is_closed()) {
            entries.remove(id);
            tracing::info!(observer = %id, "Observer closed, registration dropped");
            self.publish(&entries);
        }
    }

    /// Union of all registered masks, restricted to pollable kinds.
    pub fn effective_mask(&self) -> EventMask {
        *self.mask_tx.borrow()
    }

    /// Receiver that is notified whenever the effective mask changes.
    pub fn subscribe_mask(&self) -> watch::Receiver<EventMask> {
        self.mask_tx.subscribe()
    }

    /// Capacity of each observer's delivery queue.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn mask_of(&self, id: &str) -> Option<EventMask> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(id).map(|reg| reg.mask)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ObserverRegistration>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().cloned().collect()
    }

    fn publish(&self, entries: &HashMap<String, Arc<ObserverRegistration>>) {
        let union = entries
            .values()
            .fold(EventMask::EMPTY, |acc, reg| acc.union(reg.mask))
            .pollable();

        self.mask_tx.send_if_modified(|current| {
            if *current == union {
                return false;
            }
            *current = union;
            true
        });
        metrics::record_observers(entries.len());
    }
}
