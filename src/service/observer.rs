//! The service's own observer.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::NotificationSink;
use crate::events::{EventEnvelope, EventObserver, ProcessStatus};

/// Outbound signals published for the host environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ServiceSignal {
    ProcessChanged { status: ProcessStatus },
    ProfileReloaded { profile: String },
}

/// Forwards traffic to the notification and process/reload events to the
/// signal broadcast.
pub(crate) struct ServiceObserver {
    pub notification: Arc<dyn NotificationSink>,
    pub signals: broadcast::Sender<ServiceSignal>,
}

impl EventObserver for ServiceObserver {
    fn on_event(&self, event: &EventEnvelope) {
        let signal = match event {
            EventEnvelope::Traffic(traffic) => {
                self.notification.set_speed(traffic.up, traffic.down);
                return;
            }
            EventEnvelope::Process(status) => ServiceSignal::ProcessChanged { status: *status },
            EventEnvelope::ProfileReloaded(reloaded) => ServiceSignal::ProfileReloaded {
                profile: reloaded.profile.clone(),
            },
            _ => return,
        };

        // No receivers is fine; the signals are advisory.
        let _ = self.signals.send(signal);
    }
}
