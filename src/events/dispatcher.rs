//! Event fan-out to registered observers.

use std::sync::Arc;

use crate::events::observer::Delivery;
use crate::events::registry::SubscriptionRegistry;
use crate::events::EventEnvelope;
use crate::observability::metrics;

/// Delivers emitted events to every interested observer.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Deliver `event` without blocking.
    ///
    /// Pollable kinds reach only observers whose mask contains them; every
    /// other kind reaches all observers. A full queue sheds samples, never
    /// control events, and only for that observer.
    pub fn emit(&self, event: EventEnvelope) {
        let kind = event.kind();
        let event = Arc::new(event);
        let mut closed = Vec::new();

        for registration in self.registry.snapshot() {
            if registration.queue.is_closed() {
                closed.push(registration.id.clone());
                continue;
            }
            if kind.is_pollable() && !registration.mask.contains(kind) {
                continue;
            }

            match registration.queue.deliver(event.clone()) {
                Delivery::Queued => {}
                Delivery::Dropped => {
                    tracing::warn!(observer = %registration.id, kind = %kind, "Observer queue full, event dropped");
                    metrics::record_event_dropped(kind);
                }
                Delivery::Displaced => {
                    tracing::warn!(observer = %registration.id, kind = %kind, "Observer queue full, oldest sample dropped");
                    metrics::record_event_dropped(kind);
                }
                Delivery::Closed => closed.push(registration.id.clone()),
            }
        }

        for id in closed {
            self.registry.prune_closed(&id);
        }

        metrics::record_event_emitted(kind);
    }
}
