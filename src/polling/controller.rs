//! Interest-driven poll loop management.
//!
//! # Responsibilities
//! - Keep one poll loop per pollable kind that somebody wants
//! - React to registry mask changes and to bind-time acquire/release
//! - Tear every loop down when the engine stops
//!
//! # Design Decisions
//! - Wanted set = registry effective mask ∪ acquired kinds, empty while stopped
//! - Loops start and stop only on edges; a running loop is never restarted
//! - Stopping bumps the kind's generation under lock, then aborts the task

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::PollingConfig;
use crate::engine::Engine;
use crate::events::{EventDispatcher, EventKind, EventMask};
use crate::lifecycle::status::ProcessStateTracker;
use crate::observability::metrics;
use crate::polling::task::PollTask;

struct RunningLoop {
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PollState {
    loops: HashMap<EventKind, RunningLoop>,
    holds: HashMap<EventKind, usize>,
}

/// Handles of loops that were stopped but may not have exited yet.
#[must_use = "join the stopped pollers to confirm they exited"]
pub struct StoppedPollers {
    handles: Vec<(EventKind, JoinHandle<()>)>,
}

impl StoppedPollers {
    /// Wait until every stopped loop has exited.
    pub async fn join(self) {
        for (kind, handle) in self.handles {
            let _ = handle.await;
            tracing::debug!(kind = %kind, "Poll loop joined");
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Owner of the per-kind poll loops.
pub struct PollController {
    engine: Arc<dyn Engine>,
    dispatcher: EventDispatcher,
    status: Arc<ProcessStateTracker>,
    intervals: PollingConfig,
    generations: HashMap<EventKind, Arc<Mutex<u64>>>,
    state: Mutex<PollState>,
}

impl PollController {
    pub fn new(
        engine: Arc<dyn Engine>,
        dispatcher: EventDispatcher,
        status: Arc<ProcessStateTracker>,
        intervals: PollingConfig,
    ) -> Self {
        let generations = EventKind::POLLABLE
            .into_iter()
            .map(|kind| (kind, Arc::new(Mutex::new(0))))
            .collect();

        Self {
            engine,
            dispatcher,
            status,
            intervals,
            generations,
            state: Mutex::new(PollState::default()),
        }
    }

    /// Hold a feed open for a bound client.
    ///
    /// No-op while the engine is stopped or for kinds that are not polled.
    pub fn acquire(&self, kind: EventKind) -> bool {
        if !kind.is_pollable() || !self.status.is_started() {
            return false;
        }

        let mut state = self.lock_state();
        *state.holds.entry(kind).or_default() += 1;
        self.reconcile_locked(&mut state);
        true
    }

    /// Drop one hold taken with [`acquire`](Self::acquire). The loop keeps
    /// running while any observer's mask still wants the kind.
    pub fn release(&self, kind: EventKind) -> bool {
        if !kind.is_pollable() || !self.status.is_started() {
            return false;
        }

        let mut state = self.lock_state();
        match state.holds.get_mut(&kind) {
            Some(count) if *count > 0 => *count -= 1,
            _ => return false,
        }
        self.reconcile_locked(&mut state);
        true
    }

    /// Bring the running loops in line with the wanted set.
    pub fn reconcile(&self) {
        let mut state = self.lock_state();
        self.reconcile_locked(&mut state);
    }

    /// Stop every loop and forget all holds.
    ///
    /// Once this returns no stopped loop can emit another sample; join the
    /// result to wait for the tasks themselves.
    pub fn stop_all(&self) -> StoppedPollers {
        let mut state = self.lock_state();
        state.holds.clear();

        let kinds: Vec<EventKind> = state.loops.keys().copied().collect();
        let handles = kinds
            .into_iter()
            .filter_map(|kind| self.stop_loop(&mut state, kind).map(|handle| (kind, handle)))
            .collect();

        StoppedPollers { handles }
    }

    /// Kinds whose loop is currently running.
    pub fn running(&self) -> EventMask {
        self.lock_state().loops.keys().copied().collect()
    }

    pub fn is_running(&self, kind: EventKind) -> bool {
        self.lock_state().loops.contains_key(&kind)
    }

    pub fn holds(&self, kind: EventKind) -> usize {
        self.lock_state().holds.get(&kind).copied().unwrap_or(0)
    }

    /// Reconcile on every registry mask change until shutdown, then stop and
    /// join all loops.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut masks = self.dispatcher.registry().subscribe_mask();
        self.reconcile();

        loop {
            tokio::select! {
                changed = masks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    masks.borrow_and_update();
                    self.reconcile();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Poll controller received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        self.stop_all().join().await;
    }

    fn lock_state(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reconcile_locked(&self, state: &mut PollState) {
        let wanted = if self.status.is_started() {
            let held: EventMask = state
                .holds
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(kind, _)| *kind)
                .collect();
            self.dispatcher.registry().effective_mask().union(held).pollable()
        } else {
            EventMask::EMPTY
        };

        for kind in EventKind::POLLABLE {
            let running = state.loops.contains_key(&kind);
            match (running, wanted.contains(kind)) {
                (false, true) => self.start_loop(state, kind),
                (true, false) => {
                    // Reconciliation never waits for the task; stop_all joins.
                    let _ = self.stop_loop(state, kind);
                }
                _ => {}
            }
        }
    }

    fn start_loop(&self, state: &mut PollState, kind: EventKind) {
        let Some(current) = self.generations.get(&kind) else {
            return;
        };
        let generation = *current.lock().unwrap_or_else(PoisonError::into_inner);

        let task = PollTask {
            kind,
            generation,
            current: current.clone(),
            period: self.period(kind),
            engine: self.engine.clone(),
            dispatcher: self.dispatcher.clone(),
            status: self.status.clone(),
        };

        let handle = tokio::spawn(task.run());
        state.loops.insert(kind, RunningLoop { handle });
        metrics::record_poller(kind, true);
        tracing::info!(kind = %kind, "Poller started");
    }

    fn stop_loop(&self, state: &mut PollState, kind: EventKind) -> Option<JoinHandle<()>> {
        let running = state.loops.remove(&kind)?;

        if let Some(current) = self.generations.get(&kind) {
            *current.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        }
        running.handle.abort();

        metrics::record_poller(kind, false);
        tracing::info!(kind = %kind, "Poller stopped");
        Some(running.handle)
    }

    fn period(&self, kind: EventKind) -> Duration {
        match kind {
            EventKind::Traffic => self.intervals.traffic_interval(),
            EventKind::Bandwidth => self.intervals.bandwidth_interval(),
            _ => self.intervals.log_interval(),
        }
    }
}
