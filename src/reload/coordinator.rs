//! Serialized profile reloads.
//!
//! # Responsibilities
//! - Accept reload requests from any task
//! - Run reload jobs one at a time against the engine
//! - Turn every failure into an ERROR event plus an engine stop
//!
//! # Design Decisions
//! - One worker task drains a queue of capacity 1; a request made while a job
//!   is already queued is coalesced into it
//! - Each job re-reads process status and the active profile when it runs
//! - Panics inside a job are caught at the job boundary

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::engine::{Engine, EngineError, NotificationSink, ProfileStore, StoreError};
use crate::events::{ErrorEvent, EventDispatcher, EventEnvelope, ProfileReloaded};
use crate::lifecycle::status::ProcessStateTracker;
use crate::observability::metrics;

/// Message of the error emitted when the store has no active profile.
pub const NO_ACTIVE_PROFILE: &str = "No active profile";

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("{}", NO_ACTIVE_PROFILE)]
    NoActiveProfile,

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("reload job panicked: {0}")]
    Panicked(String),
}

/// What a single reload job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The engine was not started when the job ran.
    Skipped,
    Reloaded(ProfileReloaded),
    Failed(String),
}

/// What happened to a reload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadRequest {
    Queued,
    /// A job was already waiting; it will observe the latest state.
    Coalesced,
    /// The worker has shut down.
    Closed,
}

/// Handle used to request reloads.
#[derive(Clone)]
pub struct ReloadCoordinator {
    tx: mpsc::Sender<()>,
}

impl ReloadCoordinator {
    /// Start the worker task. The worker exits once every handle is dropped.
    pub fn spawn(worker: ReloadWorker) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(worker.run(rx));
        (Self { tx }, handle)
    }

    pub fn request_reload(&self) -> ReloadRequest {
        match self.tx.try_send(()) {
            Ok(()) => {
                tracing::debug!("Reload queued");
                ReloadRequest::Queued
            }
            Err(TrySendError::Full(())) => {
                tracing::debug!("Reload already pending, request coalesced");
                ReloadRequest::Coalesced
            }
            Err(TrySendError::Closed(())) => {
                tracing::warn!("Reload requested after the worker shut down");
                ReloadRequest::Closed
            }
        }
    }
}

/// The single executor of reload jobs.
pub struct ReloadWorker {
    pub status: Arc<ProcessStateTracker>,
    pub engine: Arc<dyn Engine>,
    pub store: Arc<dyn ProfileStore>,
    pub notification: Arc<dyn NotificationSink>,
    pub dispatcher: EventDispatcher,
}

impl ReloadWorker {
    async fn run(self, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            self.run_job().await;
        }
        tracing::debug!("Reload worker finished");
    }

    /// Execute one reload job. Never fails: errors become ERROR events.
    pub async fn run_job(&self) -> ReloadOutcome {
        if !self.status.is_started() {
            tracing::debug!("Engine not started, skipping stale reload");
            metrics::record_reload("skipped");
            return ReloadOutcome::Skipped;
        }

        let result = match AssertUnwindSafe(self.reload()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ReloadError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(reloaded) => {
                metrics::record_reload("success");
                self.dispatcher.emit(EventEnvelope::ProfileReloaded(reloaded.clone()));
                ReloadOutcome::Reloaded(reloaded)
            }
            Err(ReloadError::NoActiveProfile) => {
                tracing::warn!("No active profile, stopping engine");
                metrics::record_reload("no_profile");
                self.dispatcher
                    .emit(EventEnvelope::Error(ErrorEvent::profile_load(NO_ACTIVE_PROFILE)));
                self.stop_engine().await;
                ReloadOutcome::Failed(NO_ACTIVE_PROFILE.to_string())
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(error = %message, "Load profile failure");
                metrics::record_reload("failed");
                self.stop_engine().await;
                self.dispatcher.emit(EventEnvelope::Error(ErrorEvent::profile_load(message.clone())));
                ReloadOutcome::Failed(message)
            }
        }
    }

    async fn reload(&self) -> Result<ProfileReloaded, ReloadError> {
        let active = self
            .store
            .query_active_profile()
            .await?
            .ok_or(ReloadError::NoActiveProfile)?;

        tracing::info!(profile = %active.id, file = %active.file.display(), "Loading profile");
        self.engine.load_profile(&active.file).await?;

        let selections = self.store.query_selections(&active.id).await?;
        let mut rejected = Vec::new();
        for (group, proxy) in &selections {
            if !self.engine.set_selected_proxy(group, proxy).await? {
                rejected.push(group.clone());
            }
        }

        if !rejected.is_empty() {
            tracing::info!(profile = %active.id, groups = ?rejected, "Engine rejected stored selections");
            self.store.remove_selections(&active.id, &rejected).await?;
        }

        self.notification.set_profile(&active.name);

        Ok(ProfileReloaded {
            profile: active.name,
            rejected,
        })
    }

    async fn stop_engine(&self) {
        if let Err(e) = self.engine.stop().await {
            tracing::error!(error = %e, "Failed to stop engine after reload failure");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
