//! Observer trait and per-observer delivery queues.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::events::EventEnvelope;

/// A consumer of runtime events.
///
/// `on_event` runs on the observer's own delivery task, never on the emitting
/// task, so a slow observer only delays itself.
pub trait EventObserver: Send + Sync + 'static {
    fn on_event(&self, event: &EventEnvelope);

    /// Report that this observer can no longer receive events. The registry
    /// drops closed observers on the next emission.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> EventObserver for F
where
    F: Fn(&EventEnvelope) + Send + Sync + 'static,
{
    fn on_event(&self, event: &EventEnvelope) {
        self(event)
    }
}

/// Observer that forwards events to an async consumer through a bounded queue.
///
/// Used by remote observers (admin WebSocket) that consume events from an
/// async task of their own. The queue admits events with the same policy as
/// the per-observer delivery queue. Dropping the receiver closes the observer;
/// dropping the observer ends the receiver once it has drained.
pub struct ChannelObserver {
    queue: Arc<EventQueue>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, EventReceiver) {
        let queue = Arc::new(EventQueue::new(capacity));
        (Self { queue: queue.clone() }, EventReceiver { queue })
    }
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, event: &EventEnvelope) {
        if self.queue.push(Arc::new(event.clone())) == Delivery::Dropped {
            tracing::debug!(kind = %event.kind(), "Remote observer lagging, sample dropped");
        }
    }

    fn is_closed(&self) -> bool {
        self.queue.is_receiver_closed()
    }
}

impl Drop for ChannelObserver {
    fn drop(&mut self) {
        self.queue.close_sender();
    }
}

/// Receiving half of a [`ChannelObserver`].
pub struct EventReceiver {
    queue: Arc<EventQueue>,
}

impl EventReceiver {
    /// Next event, or `None` once the observer is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        self.queue.pop().await
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.queue.close_receiver();
    }
}

/// Result of handing one event to an observer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; a control event was queued in place of the oldest queued
    /// sample, which is lost for this observer.
    Displaced,
    /// Queue full; the sample was dropped for this observer only.
    Dropped,
    /// The observer is gone.
    Closed,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<Arc<EventEnvelope>>,
    sender_closed: bool,
    receiver_closed: bool,
}

/// Bounded single-consumer FIFO of events.
///
/// Only pollable samples are ever refused. A control event arriving at a full
/// queue evicts the oldest queued sample, and is queued past capacity when
/// the backlog holds control events only.
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    capacity: usize,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&self, event: Arc<EventEnvelope>) -> Delivery {
        let delivery = {
            let mut state = self.lock();
            if state.receiver_closed {
                return Delivery::Closed;
            }

            let mut delivery = Delivery::Queued;
            if state.events.len() >= self.capacity {
                if event.kind().is_pollable() {
                    return Delivery::Dropped;
                }
                if let Some(oldest) = state.events.iter().position(|queued| queued.kind().is_pollable()) {
                    state.events.remove(oldest);
                    delivery = Delivery::Displaced;
                }
            }
            state.events.push_back(event);
            delivery
        };

        self.ready.notify_one();
        delivery
    }

    /// Wait for the next event. Returns `None` once the sender is closed and
    /// everything queued before that has been taken.
    pub(crate) async fn pop(&self) -> Option<Arc<EventEnvelope>> {
        loop {
            {
                let mut state = self.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.sender_closed || state.receiver_closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    pub(crate) fn close_sender(&self) {
        self.lock().sender_closed = true;
        self.ready.notify_one();
    }

    pub(crate) fn close_receiver(&self) {
        let mut state = self.lock();
        state.receiver_closed = true;
        state.events.clear();
    }

    pub(crate) fn is_receiver_closed(&self) -> bool {
        self.lock().receiver_closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded FIFO in front of one observer, drained by a dedicated task.
pub(crate) struct ObserverQueue {
    queue: Arc<EventQueue>,
    observer: Arc<dyn EventObserver>,
}

impl ObserverQueue {
    /// Spawn the delivery task. Must be called from within a Tokio runtime.
    pub(crate) fn spawn(id: &str, observer: Arc<dyn EventObserver>, capacity: usize) -> Self {
        let queue = Arc::new(EventQueue::new(capacity));
        let drain = queue.clone();
        let worker = observer.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            while let Some(event) = drain.pop().await {
                let delivered =
                    std::panic::catch_unwind(AssertUnwindSafe(|| worker.on_event(&event)));
                if delivered.is_err() {
                    tracing::error!(observer = %id, kind = %event.kind(), "Observer panicked while handling event");
                }
                if worker.is_closed() {
                    break;
                }
            }
            drain.close_receiver();
            tracing::debug!(observer = %id, "Observer delivery task finished");
        });

        Self { queue, observer }
    }

    pub(crate) fn deliver(&self, event: Arc<EventEnvelope>) -> Delivery {
        self.queue.push(event)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.queue.is_receiver_closed() || self.observer.is_closed()
    }

    pub(crate) fn serves(&self, observer: &Arc<dyn EventObserver>) -> bool {
        Arc::ptr_eq(&self.observer, observer)
    }
}

impl Drop for ObserverQueue {
    fn drop(&mut self) {
        self.queue.close_sender();
    }
}
