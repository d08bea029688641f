//! Persistent notification sink.

use std::sync::{Mutex, PoisonError};

/// Receiver of the state a persistent notification would display.
pub trait NotificationSink: Send + Sync {
    fn set_profile(&self, name: &str);
    fn set_speed(&self, up: u64, down: u64);
    fn show(&self);
    fn cancel(&self);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct NotificationState {
    visible: bool,
    profile: Option<String>,
    up: u64,
    down: u64,
}

/// Notification sink for headless hosts: keeps the last state and records
/// changes through `tracing` instead of rendering them.
#[derive(Debug, Default)]
pub struct LogNotification {
    state: Mutex<NotificationState>,
}

impl LogNotification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_visible(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).visible
    }

    pub fn profile(&self) -> Option<String> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).profile.clone()
    }

    pub fn speed(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.up, state.down)
    }
}

impl NotificationSink for LogNotification {
    fn set_profile(&self, name: &str) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).profile = Some(name.to_string());
        tracing::info!(profile = %name, "Notification profile updated");
    }

    fn set_speed(&self, up: u64, down: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.up = up;
        state.down = down;
        tracing::trace!(up, down, "Notification speed updated");
    }

    fn show(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).visible = true;
        tracing::debug!("Notification shown");
    }

    fn cancel(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).visible = false;
        tracing::debug!("Notification cancelled");
    }
}
