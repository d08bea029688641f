//! Shared utilities for integration testing.
//!
//! `MockEngine` and `MockStore` mirror the crate-private scripted doubles in
//! `src/engine/testing.rs`, which integration tests cannot see. They add
//! selection recording and externally reported status changes.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use engine_service::config::ServiceConfig;
use engine_service::engine::{
    ActiveProfile, Engine, EngineError, EngineResult, NotificationSink, ProfileStore, StoreError,
};
use engine_service::events::{Bandwidth, EventEnvelope, EventKind, EventObserver, LogLevel, LogLine, ProcessStatus, Traffic};
use engine_service::EngineService;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Engine whose behaviour is scripted by the test.
pub struct MockEngine {
    status: watch::Sender<ProcessStatus>,
    pub load_error: Mutex<Option<String>>,
    pub load_delay: Mutex<Duration>,
    pub rejected_groups: Mutex<HashSet<String>>,
    pub loaded: Mutex<Vec<PathBuf>>,
    pub selected: Mutex<Vec<(String, String)>>,
    pub polls: Mutex<HashMap<EventKind, usize>>,
    pub calls_while_stopped: AtomicUsize,
    pub stop_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ProcessStatus::Stopped);
        Self {
            status,
            load_error: Mutex::new(None),
            load_delay: Mutex::new(Duration::ZERO),
            rejected_groups: Mutex::new(HashSet::new()),
            loaded: Mutex::new(Vec::new()),
            selected: Mutex::new(Vec::new()),
            polls: Mutex::new(HashMap::new()),
            calls_while_stopped: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Report a status as if the engine process changed state on its own.
    pub fn report(&self, status: ProcessStatus) {
        self.status.send_replace(status);
    }

    pub fn poll_count(&self, kind: EventKind) -> usize {
        self.polls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    pub fn load_count(&self) -> usize {
        self.loaded.lock().unwrap().len()
    }

    fn record_call(&self) {
        if *self.status.borrow() == ProcessStatus::Stopped {
            self.calls_while_stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_poll(&self, kind: EventKind) {
        self.record_call();
        *self.polls.lock().unwrap().entry(kind).or_default() += 1;
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn start(&self) -> EngineResult<()> {
        self.status.send_replace(ProcessStatus::Starting);
        self.status.send_replace(ProcessStatus::Started);
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.status.send_replace(ProcessStatus::Stopped);
        Ok(())
    }

    fn current_status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    fn subscribe_status(&self) -> watch::Receiver<ProcessStatus> {
        self.status.subscribe()
    }

    async fn load_profile(&self, path: &Path) -> EngineResult<()> {
        self.record_call();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.load_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.loaded.lock().unwrap().push(path.to_path_buf());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match self.load_error.lock().unwrap().clone() {
            Some(message) => Err(EngineError::Load(message)),
            None => Ok(()),
        }
    }

    async fn set_selected_proxy(&self, group: &str, proxy: &str) -> EngineResult<bool> {
        self.record_call();
        self.selected.lock().unwrap().push((group.to_string(), proxy.to_string()));
        Ok(!self.rejected_groups.lock().unwrap().contains(group))
    }

    async fn poll_traffic(&self) -> EngineResult<Traffic> {
        self.record_poll(EventKind::Traffic);
        Ok(Traffic { up: 10, down: 20 })
    }

    async fn poll_bandwidth(&self) -> EngineResult<Bandwidth> {
        self.record_poll(EventKind::Bandwidth);
        Ok(Bandwidth { total: 1_000 })
    }

    async fn poll_logs(&self) -> EngineResult<Vec<LogLine>> {
        self.record_poll(EventKind::Log);
        Ok(vec![LogLine {
            level: LogLevel::Info,
            message: "engine log".into(),
        }])
    }
}

/// In-memory profile store with inspection hooks.
#[derive(Default)]
pub struct MockStore {
    pub active: Mutex<Option<ActiveProfile>>,
    pub selections: Mutex<BTreeMap<String, String>>,
    pub removed: Mutex<Vec<(String, Vec<String>)>>,
    pub fail_selections: Mutex<bool>,
}

impl MockStore {
    pub fn with_profile(id: &str, name: &str) -> Self {
        let store = Self::default();
        *store.active.lock().unwrap() = Some(ActiveProfile {
            id: id.into(),
            file: PathBuf::from(format!("/profiles/{id}.yaml")),
            name: name.into(),
        });
        store
    }

    pub fn select(&self, group: &str, proxy: &str) {
        self.selections.lock().unwrap().insert(group.into(), proxy.into());
    }
}

#[async_trait]
impl ProfileStore for MockStore {
    async fn query_active_profile(&self) -> Result<Option<ActiveProfile>, StoreError> {
        Ok(self.active.lock().unwrap().clone())
    }

    async fn query_selections(&self, _profile_id: &str) -> Result<BTreeMap<String, String>, StoreError> {
        if *self.fail_selections.lock().unwrap() {
            return Err(StoreError::Unavailable("selection table locked".into()));
        }
        Ok(self.selections.lock().unwrap().clone())
    }

    async fn remove_selections(&self, profile_id: &str, groups: &[String]) -> Result<(), StoreError> {
        let mut selections = self.selections.lock().unwrap();
        for group in groups {
            selections.remove(group);
        }
        self.removed.lock().unwrap().push((profile_id.to_string(), groups.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotification {
    pub profiles: Mutex<Vec<String>>,
    pub speeds: Mutex<Vec<(u64, u64)>>,
    pub shown: AtomicUsize,
    pub cancelled: AtomicUsize,
}

impl NotificationSink for RecordingNotification {
    fn set_profile(&self, name: &str) {
        self.profiles.lock().unwrap().push(name.to_string());
    }

    fn set_speed(&self, up: u64, down: u64) {
        self.speeds.lock().unwrap().push((up, down));
    }

    fn show(&self) {
        self.shown.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Observer that keeps every event it receives.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventObserver for RecordingObserver {
    fn on_event(&self, event: &EventEnvelope) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub store: Arc<MockStore>,
    pub notification: Arc<RecordingNotification>,
    pub service: Arc<EngineService>,
}

/// Config with fast poll loops.
pub fn fast_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.polling.traffic_interval_ms = 10;
    config.polling.bandwidth_interval_ms = 10;
    config.polling.log_interval_ms = 10;
    config
}

pub fn harness(store: MockStore) -> Harness {
    harness_with(fast_config(), store)
}

pub fn harness_with(config: ServiceConfig, store: MockStore) -> Harness {
    let engine = Arc::new(MockEngine::new());
    let store = Arc::new(store);
    let notification = Arc::new(RecordingNotification::default());
    let service = EngineService::new(&config, engine.clone(), store.clone(), notification.clone());
    Harness {
        engine,
        store,
        notification,
        service,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

/// Start a programmable mock server on an ephemeral port.
pub async fn start_programmable_backend<F, Fut>(router: F) -> SocketAddr
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = axum::Router>,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router().await;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}
