//! Engine service composition root.
//!
//! # Responsibilities
//! - Own the tracker, registry, dispatcher, poll controller and reload queue
//! - Turn engine status changes into the ordered side effects of a transition
//! - Expose observer registration, bind-time feed control and power handling
//!
//! # Data Flow
//! ```text
//! Engine status watch ──control task──▶ transition()
//!     STARTED: PROCESS event → reload request → notification.show → reconcile pollers
//!     STOPPED: PROCESS event → stop pollers → zero TRAFFIC/BANDWIDTH → join → cancel → shutdown
//!
//! register/unregister/power ──▶ registry ──mask watch──▶ poll controller
//! ```
//!
//! # Design Decisions
//! - Transitions are serialized by an async mutex so the side effects of two
//!   transitions never interleave
//! - Background tasks hold a `Weak` reference; dropping the service ends them
//! - An engine STOPPED transition requests host self-termination

mod observer;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::engine::{Engine, EngineResult, NotificationSink, ProfileStore};
use crate::events::{
    Bandwidth, EventDispatcher, EventEnvelope, EventKind, EventMask, EventObserver, ProcessStatus,
    SubscriptionRegistry, Traffic,
};
use crate::lifecycle::{PowerState, ProcessStateTracker, Shutdown};
use crate::observability::metrics;
use crate::polling::PollController;
use crate::reload::{ReloadCoordinator, ReloadRequest, ReloadWorker};

pub use observer::ServiceSignal;

const SIGNAL_CAPACITY: usize = 64;

/// Point-in-time view of the service, served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub status: ProcessStatus,
    pub power: PowerState,
    pub effective_mask: EventMask,
    pub running_pollers: EventMask,
    pub observers: usize,
    pub version: &'static str,
}

pub struct EngineService {
    id: String,
    engine: Arc<dyn Engine>,
    notification: Arc<dyn NotificationSink>,
    status: Arc<ProcessStateTracker>,
    dispatcher: EventDispatcher,
    poll: Arc<PollController>,
    reload: Mutex<Option<ReloadCoordinator>>,
    reload_worker: Mutex<Option<JoinHandle<()>>>,
    transitions: tokio::sync::Mutex<()>,
    power: Mutex<PowerState>,
    signals: broadcast::Sender<ServiceSignal>,
    shutdown: Shutdown,
}

impl EngineService {
    /// Wire the service and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: &ServiceConfig,
        engine: Arc<dyn Engine>,
        store: Arc<dyn ProfileStore>,
        notification: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        let status = Arc::new(ProcessStateTracker::new());
        let registry = Arc::new(SubscriptionRegistry::new(config.service.observer_queue_capacity));
        let dispatcher = EventDispatcher::new(registry.clone());
        let poll = Arc::new(PollController::new(
            engine.clone(),
            dispatcher.clone(),
            status.clone(),
            config.polling.clone(),
        ));

        let (reload, reload_worker) = ReloadCoordinator::spawn(ReloadWorker {
            status: status.clone(),
            engine: engine.clone(),
            store,
            notification: notification.clone(),
            dispatcher: dispatcher.clone(),
        });

        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let builtin: Arc<dyn EventObserver> = Arc::new(observer::ServiceObserver {
            notification: notification.clone(),
            signals: signals.clone(),
        });
        registry.register(config.service.id.clone(), Self::builtin_mask(PowerState::On), builtin);

        let service = Arc::new(Self {
            id: config.service.id.clone(),
            engine,
            notification,
            status,
            dispatcher,
            poll,
            reload: Mutex::new(Some(reload)),
            reload_worker: Mutex::new(Some(reload_worker)),
            transitions: tokio::sync::Mutex::new(()),
            power: Mutex::new(PowerState::On),
            signals,
            shutdown: Shutdown::new(),
        });

        tokio::spawn(service.poll.clone().run(service.shutdown.subscribe()));
        tokio::spawn(Self::follow_engine(Arc::downgrade(&service), service.shutdown.subscribe()));

        tracing::info!(id = %service.id, "Engine service created");
        service
    }

    /// Show the notification and start the engine.
    pub async fn start_engine(&self) -> EngineResult<()> {
        tracing::info!("Starting engine");
        self.notification.show();
        self.engine.start().await
    }

    pub async fn stop_engine(&self) -> EngineResult<()> {
        tracing::info!("Stopping engine");
        self.engine.stop().await
    }

    /// Apply a status reported by the engine.
    ///
    /// Returns whether the tracked status changed. Transient statuses and
    /// repeats of the current status do nothing.
    pub async fn transition(&self, status: ProcessStatus) -> bool {
        let _serialized = self.transitions.lock().await;

        let Some(previous) = self.status.transition(status) else {
            return false;
        };
        tracing::info!(from = previous.as_str(), to = status.as_str(), "Engine status changed");
        metrics::record_process_status(status);

        self.dispatcher.emit(EventEnvelope::Process(status));

        match status {
            ProcessStatus::Started => {
                self.request_reload();
                self.notification.show();
                self.poll.reconcile();
            }
            ProcessStatus::Stopped => {
                let stopped = self.poll.stop_all();
                self.dispatcher.emit(EventEnvelope::Traffic(Traffic { up: 0, down: 0 }));
                self.dispatcher.emit(EventEnvelope::Bandwidth(Bandwidth { total: 0 }));
                stopped.join().await;

                self.notification.cancel();
                self.shutdown.trigger();
            }
            ProcessStatus::Starting | ProcessStatus::Stopping => {}
        }
        true
    }

    /// Register `observer` under `id`, replacing any previous registration.
    pub fn register_observer(&self, id: impl Into<String>, mask: EventMask, observer: Arc<dyn EventObserver>) {
        let id = id.into();
        tracing::debug!(observer = %id, mask = ?mask, "Registering observer");
        self.dispatcher.registry().register(id, mask, observer);
    }

    pub fn unregister_observer(&self, id: &str) -> bool {
        tracing::debug!(observer = %id, "Unregistering observer");
        self.dispatcher.registry().unregister(id)
    }

    /// Unregister `id` only while it still belongs to `observer`.
    pub fn unregister_observer_if(&self, id: &str, observer: &Arc<dyn EventObserver>) -> bool {
        self.dispatcher.registry().unregister_if(id, observer)
    }

    /// Keep the poll loop for `kind` running while a client is bound.
    pub fn acquire_event(&self, kind: EventKind) -> bool {
        self.poll.acquire(kind)
    }

    pub fn release_event(&self, kind: EventKind) -> bool {
        self.poll.release(kind)
    }

    pub fn request_reload(&self) -> ReloadRequest {
        match lock(&self.reload).as_ref() {
            Some(reload) => reload.request_reload(),
            None => ReloadRequest::Closed,
        }
    }

    /// The stored profile selection changed.
    pub fn on_profile_changed(&self) -> ReloadRequest {
        tracing::info!("Active profile changed");
        self.request_reload()
    }

    /// Narrow the built-in observer to nothing pollable while the screen is
    /// off, and restore it when the screen comes back.
    pub fn on_power_changed(&self, power: PowerState) {
        {
            let mut current = lock(&self.power);
            if *current == power {
                return;
            }
            *current = power;
        }

        tracing::info!(power = %power, "Power state changed");
        self.dispatcher
            .registry()
            .set_mask(&self.id, Self::builtin_mask(power));
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<ServiceSignal> {
        self.signals.subscribe()
    }

    /// Receiver that fires when the service shuts down.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Resolves once the service asked its host to terminate.
    pub fn terminated(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.shutdown.wait()
    }

    pub fn process_status(&self) -> ProcessStatus {
        self.status.current()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.dispatcher.registry()
    }

    pub fn poll_controller(&self) -> &Arc<PollController> {
        &self.poll
    }

    pub fn status(&self) -> ServiceStatus {
        let registry = self.dispatcher.registry();
        ServiceStatus {
            status: self.status.current(),
            power: *lock(&self.power),
            effective_mask: registry.effective_mask(),
            running_pollers: self.poll.running(),
            observers: registry.len(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Stop the engine, tear every task down and request termination.
    pub async fn destroy(&self) {
        tracing::info!("Destroying engine service");

        if let Err(e) = self.engine.stop().await {
            tracing::warn!(error = %e, "Failed to stop engine during destroy");
        }
        self.transition(ProcessStatus::Stopped).await;
        self.poll.stop_all().join().await;

        // Dropping the last sender lets the worker drain and exit.
        drop(lock(&self.reload).take());
        let worker = lock(&self.reload_worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Reload worker failed");
            }
        }

        self.dispatcher.registry().unregister(&self.id);
        self.shutdown.trigger();
        tracing::info!("Engine service destroyed");
    }

    fn builtin_mask(power: PowerState) -> EventMask {
        match power {
            PowerState::On => EventMask::of([EventKind::Traffic]),
            PowerState::Off => EventMask::EMPTY,
        }
    }

    async fn follow_engine(service: Weak<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut statuses = match service.upgrade() {
            Some(service) => service.engine.subscribe_status(),
            None => return,
        };

        let initial = *statuses.borrow_and_update();
        if let Some(service) = service.upgrade() {
            service.transition(initial).await;
        }

        loop {
            tokio::select! {
                changed = statuses.changed() => {
                    if changed.is_err() {
                        tracing::debug!("Engine status channel closed");
                        break;
                    }
                    let status = *statuses.borrow_and_update();
                    tracing::debug!(status = status.as_str(), "Engine reported status");

                    let Some(service) = service.upgrade() else {
                        break;
                    };
                    service.transition(status).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Control task received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
