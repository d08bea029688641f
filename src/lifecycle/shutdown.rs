//! Shutdown coordination for the service.

use tokio::sync::{broadcast, watch};

/// Coordinator for service shutdown.
///
/// Long-running tasks subscribe to the broadcast channel and leave their
/// loops when it fires. The latched flag lets late callers (the host binary
/// waiting on self-termination) observe a trigger that already happened.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
    /// Set once, never cleared.
    latched: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        let (latched, _) = watch::channel(false);
        Self { tx, latched }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal. Later triggers are no-ops.
    pub fn trigger(&self) {
        let first = self.latched.send_if_modified(|triggered| !std::mem::replace(triggered, true));
        if first {
            tracing::info!(receivers = self.tx.receiver_count(), "Shutdown triggered");
            let _ = self.tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.latched.borrow()
    }

    /// Resolve once [`trigger`](Self::trigger) has been called, including
    /// when it was called before this future was created.
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.latched.subscribe();
        async move {
            let _ = rx.wait_for(|triggered| *triggered).await;
        }
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
