//! End-to-end behaviour of the engine service against a scripted engine.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use engine_service::events::{
    Bandwidth, ErrorType, EventEnvelope, EventKind, EventMask, EventObserver, ProcessStatus,
    ProfileReloaded, Traffic,
};
use engine_service::lifecycle::PowerState;
use engine_service::ServiceSignal;

mod common;
use common::{eventually, harness, settle, MockStore, RecordingObserver};

const WAIT: Duration = Duration::from_secs(2);

fn observe(h: &common::Harness, id: &str, kinds: &[EventKind]) -> Arc<RecordingObserver> {
    let observer = Arc::new(RecordingObserver::default());
    h.service
        .register_observer(id, kinds.iter().copied().collect(), observer.clone());
    observer
}

#[tokio::test]
async fn test_no_active_profile_stops_engine() {
    let h = harness(MockStore::default());
    let observer = observe(&h, "ui", &[]);

    h.service.start_engine().await.unwrap();
    tokio::time::timeout(WAIT, h.service.terminated())
        .await
        .expect("engine should be stopped after a reload without profile");

    assert_eq!(h.service.process_status(), ProcessStatus::Stopped);
    assert_eq!(h.engine.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.load_count(), 0);

    assert!(eventually(WAIT, || observer.count(EventKind::Process) == 2).await);
    let events = observer.events();
    assert_eq!(events[0], EventEnvelope::Process(ProcessStatus::Started));
    match &events[1] {
        EventEnvelope::Error(error) => {
            assert_eq!(error.error_type, ErrorType::ProfileLoad);
            assert_eq!(error.message, "No active profile");
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(events[2], EventEnvelope::Process(ProcessStatus::Stopped));
}

#[tokio::test]
async fn test_all_selections_accepted() {
    let store = MockStore::with_profile("p1", "Home");
    store.select("groupA", "tokyo");
    store.select("groupB", "direct");
    let h = harness(store);
    let observer = observe(&h, "ui", &[]);

    h.service.start_engine().await.unwrap();
    assert!(eventually(WAIT, || observer.count(EventKind::ProfileReloaded) == 1).await);

    let reloaded = observer
        .events()
        .into_iter()
        .find(|e| e.kind() == EventKind::ProfileReloaded)
        .unwrap();
    assert_eq!(
        reloaded,
        EventEnvelope::ProfileReloaded(ProfileReloaded {
            profile: "Home".into(),
            rejected: vec![],
        })
    );
    assert!(h.store.removed.lock().unwrap().is_empty());
    assert_eq!(*h.notification.profiles.lock().unwrap(), vec!["Home".to_string()]);
    assert_eq!(h.engine.selected.lock().unwrap().len(), 2);
    assert_eq!(h.service.process_status(), ProcessStatus::Started);
}

#[tokio::test]
async fn test_rejected_selection_is_removed() {
    let store = MockStore::with_profile("p1", "Home");
    store.select("groupA", "gone");
    store.select("groupB", "direct");
    let h = harness(store);
    h.engine.rejected_groups.lock().unwrap().insert("groupA".into());
    let observer = observe(&h, "ui", &[]);

    h.service.start_engine().await.unwrap();
    assert!(eventually(WAIT, || observer.count(EventKind::ProfileReloaded) == 1).await);

    assert_eq!(
        *h.store.removed.lock().unwrap(),
        vec![("p1".to_string(), vec!["groupA".to_string()])]
    );
    assert!(!h.store.selections.lock().unwrap().contains_key("groupA"));
    assert!(observer.events().contains(&EventEnvelope::ProfileReloaded(ProfileReloaded {
        profile: "Home".into(),
        rejected: vec!["groupA".into()],
    })));
}

#[tokio::test]
async fn test_load_failure_emits_error_and_stops() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    *h.engine.load_error.lock().unwrap() = Some("unknown proxy group".into());
    let observer = observe(&h, "ui", &[]);

    h.service.start_engine().await.unwrap();
    tokio::time::timeout(WAIT, h.service.terminated()).await.unwrap();

    assert!(eventually(WAIT, || observer.count(EventKind::Error) == 1).await);
    let error = observer
        .events()
        .into_iter()
        .find_map(|e| match e {
            EventEnvelope::Error(error) => Some(error),
            _ => None,
        })
        .unwrap();
    assert_eq!(error.message, "unknown proxy group");
    assert!(h.notification.profiles.lock().unwrap().is_empty());
    assert_eq!(observer.count(EventKind::ProfileReloaded), 0);
}

#[tokio::test]
async fn test_store_failure_takes_load_failure_path() {
    let store = MockStore::with_profile("p1", "Home");
    *store.fail_selections.lock().unwrap() = true;
    let h = harness(store);
    let observer = observe(&h, "ui", &[]);

    h.service.start_engine().await.unwrap();
    tokio::time::timeout(WAIT, h.service.terminated()).await.unwrap();

    assert!(eventually(WAIT, || observer.count(EventKind::Error) == 1).await);
    assert_eq!(h.engine.stop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_power_off_stops_builtin_traffic_poller() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    h.service.start_engine().await.unwrap();

    let poll = h.service.poll_controller().clone();
    assert!(eventually(WAIT, || poll.is_running(EventKind::Traffic)).await);
    assert!(eventually(WAIT, || !h.notification.speeds.lock().unwrap().is_empty()).await);

    h.service.on_power_changed(PowerState::Off);
    assert!(eventually(WAIT, || !poll.is_running(EventKind::Traffic)).await);

    settle().await;
    let polls = h.engine.poll_count(EventKind::Traffic);
    settle().await;
    assert_eq!(h.engine.poll_count(EventKind::Traffic), polls);

    h.service.on_power_changed(PowerState::On);
    assert!(eventually(WAIT, || poll.is_running(EventKind::Traffic)).await);
}

#[tokio::test]
async fn test_power_off_still_delivers_non_pollable_events() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    let mut signals = h.service.subscribe_signals();
    h.service.on_power_changed(PowerState::Off);

    h.service.start_engine().await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let signal = tokio::time::timeout(WAIT, signals.recv()).await.unwrap().unwrap();
        seen.push(signal);
    }
    assert_eq!(
        seen,
        vec![
            ServiceSignal::ProcessChanged {
                status: ProcessStatus::Started
            },
            ServiceSignal::ProfileReloaded {
                profile: "Home".into()
            },
        ]
    );
    assert!(!h.service.poll_controller().is_running(EventKind::Traffic));
}

#[tokio::test]
async fn test_started_twice_is_idempotent() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    let observer = observe(&h, "ui", &[]);

    assert!(h.service.transition(ProcessStatus::Started).await);
    assert!(!h.service.transition(ProcessStatus::Started).await);
    assert!(!h.service.transition(ProcessStatus::Starting).await);

    assert!(eventually(WAIT, || observer.count(EventKind::ProfileReloaded) == 1).await);
    settle().await;
    assert_eq!(observer.count(EventKind::Process), 1);
    assert_eq!(h.engine.load_count(), 1);
}

#[tokio::test]
async fn test_stop_emits_zero_samples_once() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    let observer = observe(&h, "meter", &[EventKind::Traffic, EventKind::Bandwidth]);

    h.service.start_engine().await.unwrap();
    assert!(eventually(WAIT, || observer.count(EventKind::Bandwidth) > 2).await);

    h.service.stop_engine().await.unwrap();
    tokio::time::timeout(WAIT, h.service.terminated()).await.unwrap();
    assert!(h.service.poll_controller().running().is_empty());

    assert!(eventually(WAIT, || observer.count(EventKind::Process) == 2).await);
    settle().await;
    let events = observer.events();

    let zero_traffic = EventEnvelope::Traffic(Traffic { up: 0, down: 0 });
    let zero_bandwidth = EventEnvelope::Bandwidth(Bandwidth { total: 0 });
    assert_eq!(events.iter().filter(|e| **e == zero_traffic).count(), 1);
    assert_eq!(events.iter().filter(|e| **e == zero_bandwidth).count(), 1);

    // Nothing sampled may follow the zeros.
    let last_traffic = events.iter().rev().find(|e| e.kind() == EventKind::Traffic).unwrap();
    let last_bandwidth = events.iter().rev().find(|e| e.kind() == EventKind::Bandwidth).unwrap();
    assert_eq!(*last_traffic, zero_traffic);
    assert_eq!(*last_bandwidth, zero_bandwidth);

    assert_eq!(*h.notification.speeds.lock().unwrap().last().unwrap(), (0, 0));
    assert_eq!(h.notification.cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_no_polling_while_stopped() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    observe(&h, "ui", &[EventKind::Log, EventKind::Bandwidth]);

    assert!(!h.service.acquire_event(EventKind::Traffic));
    settle().await;
    assert!(h.service.poll_controller().running().is_empty());
    assert_eq!(h.engine.poll_count(EventKind::Log), 0);
    assert_eq!(h.engine.poll_count(EventKind::Bandwidth), 0);

    h.service.start_engine().await.unwrap();
    let poll = h.service.poll_controller().clone();
    assert!(eventually(WAIT, || poll.running().iter().count() == 3).await);

    h.service.stop_engine().await.unwrap();
    tokio::time::timeout(WAIT, h.service.terminated()).await.unwrap();

    let before: usize = EventKind::POLLABLE.iter().map(|k| h.engine.poll_count(*k)).sum();
    settle().await;
    let after: usize = EventKind::POLLABLE.iter().map(|k| h.engine.poll_count(*k)).sum();
    assert_eq!(before, after);
    assert!(!h.service.acquire_event(EventKind::Log));
    assert!(poll.running().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reload_requests_never_overlap() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    *h.engine.load_delay.lock().unwrap() = Duration::from_millis(15);
    h.service.start_engine().await.unwrap();
    assert!(eventually(WAIT, || h.engine.load_count() == 1).await);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                service.request_reload();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    settle().await;

    assert_eq!(h.engine.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(h.engine.load_count() >= 2);
    assert!(h.engine.load_count() < 80);
}

#[tokio::test]
async fn test_acquire_holds_feed_until_release() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    h.service.start_engine().await.unwrap();
    let poll = h.service.poll_controller().clone();
    assert!(eventually(WAIT, || h.service.process_status() == ProcessStatus::Started).await);

    assert!(h.service.acquire_event(EventKind::Bandwidth));
    assert!(poll.is_running(EventKind::Bandwidth));
    assert!(eventually(WAIT, || h.engine.poll_count(EventKind::Bandwidth) > 0).await);

    assert!(h.service.release_event(EventKind::Bandwidth));
    assert!(!poll.is_running(EventKind::Bandwidth));
    assert!(poll.is_running(EventKind::Traffic));
}

#[tokio::test]
async fn test_reregister_replaces_mask() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    h.service.start_engine().await.unwrap();
    let poll = h.service.poll_controller().clone();

    let observer = observe(&h, "ui", &[EventKind::Log]);
    assert!(eventually(WAIT, || poll.is_running(EventKind::Log)).await);
    assert!(eventually(WAIT, || observer.count(EventKind::Log) > 0).await);

    h.service
        .register_observer("ui", EventMask::of([EventKind::Bandwidth]), observer.clone());
    assert!(eventually(WAIT, || !poll.is_running(EventKind::Log)).await);
    assert!(poll.is_running(EventKind::Bandwidth));

    assert!(h.service.unregister_observer("ui"));
    assert!(eventually(WAIT, || poll.running() == EventMask::of([EventKind::Traffic])).await);
}

#[tokio::test]
async fn test_panicking_observer_does_not_affect_others() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    let faulty: Arc<dyn EventObserver> = Arc::new(|_: &EventEnvelope| panic!("observer bug"));
    h.service.register_observer("faulty", EventMask::EMPTY, faulty);
    let observer = observe(&h, "ui", &[]);

    h.service.start_engine().await.unwrap();
    assert!(eventually(WAIT, || observer.count(EventKind::ProfileReloaded) == 1).await);
    assert_eq!(observer.events()[0], EventEnvelope::Process(ProcessStatus::Started));
}

#[tokio::test]
async fn test_engine_exit_terminates_service() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    h.service.start_engine().await.unwrap();
    assert!(eventually(WAIT, || h.engine.load_count() == 1).await);

    h.engine.report(ProcessStatus::Stopped);
    tokio::time::timeout(WAIT, h.service.terminated()).await.unwrap();
    assert_eq!(h.service.process_status(), ProcessStatus::Stopped);
}

#[tokio::test]
async fn test_profile_change_requests_reload() {
    let h = harness(MockStore::with_profile("p1", "Home"));
    h.service.start_engine().await.unwrap();
    assert!(eventually(WAIT, || h.engine.load_count() == 1).await);

    *h.store.active.lock().unwrap() = Some(engine_service::engine::ActiveProfile {
        id: "p2".into(),
        file: "/profiles/p2.yaml".into(),
        name: "Work".into(),
    });
    h.service.on_profile_changed();

    assert!(eventually(WAIT, || h.engine.load_count() == 2).await);
    assert!(eventually(WAIT, || h.notification.profiles.lock().unwrap().last().map(String::as_str) == Some("Work")).await);
}
