//! Scripted engine and store for unit tests.
//!
//! Integration tests keep their own copy in `tests/common`, which can only
//! reach the public API. The knobs and counters use the same names in both;
//! only the integration copy records selections and reports external status
//! changes, since only the service-level tests need them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::engine::profile::StoreResult;
use crate::engine::{ActiveProfile, Engine, EngineError, EngineResult, NotificationSink, ProfileStore};
use crate::events::{Bandwidth, EventKind, LogLevel, LogLine, ProcessStatus, Traffic};

pub(crate) struct ScriptedEngine {
    status: watch::Sender<ProcessStatus>,
    pub load_error: Mutex<Option<String>>,
    pub load_delay: Mutex<Duration>,
    pub rejected_groups: Mutex<HashSet<String>>,
    pub loaded: Mutex<Vec<PathBuf>>,
    pub polls: Mutex<HashMap<EventKind, usize>>,
    pub calls_while_stopped: AtomicUsize,
    pub stop_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ProcessStatus::Stopped);
        Self {
            status,
            load_error: Mutex::new(None),
            load_delay: Mutex::new(Duration::ZERO),
            rejected_groups: Mutex::new(HashSet::new()),
            loaded: Mutex::new(Vec::new()),
            polls: Mutex::new(HashMap::new()),
            calls_while_stopped: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn poll_count(&self, kind: EventKind) -> usize {
        self.polls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    fn record_poll(&self, kind: EventKind) {
        if *self.status.borrow() == ProcessStatus::Stopped {
            self.calls_while_stopped.fetch_add(1, Ordering::SeqCst);
        }
        *self.polls.lock().unwrap().entry(kind).or_default() += 1;
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn start(&self) -> EngineResult<()> {
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

    async fn set_selected_proxy(&self, group: &str, _proxy: &str) -> EngineResult<bool> {
        Ok(!self.rejected_groups.lock().unwrap().contains(group))
    }

    async fn poll_traffic(&self) -> EngineResult<Traffic> {
        self.record_poll(EventKind::Traffic);
        Ok(Traffic { up: 7, down: 9 })
    }

    async fn poll_bandwidth(&self) -> EngineResult<Bandwidth> {
        self.record_poll(EventKind::Bandwidth);
        Ok(Bandwidth { total: 42 })
    }

    async fn poll_logs(&self) -> EngineResult<Vec<LogLine>> {
        self.record_poll(EventKind::Log);
        Ok(vec![LogLine {
            level: LogLevel::Info,
            message: "tick".into(),
        }])
    }
}

#[derive(Default)]
pub(crate) struct ScriptedStore {
    pub active: Mutex<Option<ActiveProfile>>,
    pub selections: Mutex<BTreeMap<String, String>>,
    pub removed: Mutex<Vec<Vec<String>>>,
}

impl ScriptedStore {
    pub fn with_profile(name: &str) -> Self {
        let store = Self::default();
        *store.active.lock().unwrap() = Some(ActiveProfile {
            id: "p1".into(),
            file: PathBuf::from(format!("/profiles/{name}.yaml")),
            name: name.into(),
        });
        store
    }
}

#[async_trait]
impl ProfileStore for ScriptedStore {
    async fn query_active_profile(&self) -> StoreResult<Option<ActiveProfile>> {
        Ok(self.active.lock().unwrap().clone())
    }

    async fn query_selections(&self, _profile_id: &str) -> StoreResult<BTreeMap<String, String>> {
        Ok(self.selections.lock().unwrap().clone())
    }

    async fn remove_selections(&self, _profile_id: &str, groups: &[String]) -> StoreResult<()> {
        self.removed.lock().unwrap().push(groups.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotification {
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
