//! Engine process state tracking.
//!
//! # States
//! ```text
//! Stopped ──transition(Started)──▶ Started
//! Started ──transition(Stopped)──▶ Stopped
//! ```
//! `Starting` and `Stopping` are reported by engines while a process is being
//! spawned or killed. They are never stored: only the two settled states
//! change what the rest of the service does.
//!
//! # Design Decisions
//! - One `watch` channel is the only synchronization primitive; compare and
//!   update happen inside `send_if_modified`
//! - Repeating the current status is a no-op and does not notify receivers

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle state of the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Started => "started",
            ProcessStatus::Stopping => "stopping",
        }
    }

    /// Whether this status can be stored by the tracker.
    pub fn is_settled(self) -> bool {
        matches!(self, ProcessStatus::Stopped | ProcessStatus::Started)
    }
}

/// Authoritative holder of the engine's settled process status.
#[derive(Debug)]
pub struct ProcessStateTracker {
    tx: watch::Sender<ProcessStatus>,
}

impl ProcessStateTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProcessStatus::Stopped);
        Self { tx }
    }

    /// Record a new status.
    ///
    /// Returns the previous status when the stored value actually changed,
    /// `None` for repeats and for transient statuses.
    pub fn transition(&self, status: ProcessStatus) -> Option<ProcessStatus> {
        if !status.is_settled() {
            tracing::debug!(status = status.as_str(), "Ignoring transient process status");
            return None;
        }

        let mut previous = None;
        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            previous = Some(*current);
            *current = status;
            true
        });

        if let Some(from) = previous {
            tracing::info!(from = from.as_str(), to = status.as_str(), "Process status changed");
        }
        previous
    }

    pub fn current(&self) -> ProcessStatus {
        *self.tx.borrow()
    }

    pub fn is_started(&self) -> bool {
        self.current() == ProcessStatus::Started
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.tx.subscribe()
    }
}

impl Default for ProcessStateTracker {
    fn default() -> Self {
        Self::new()
    }
}
