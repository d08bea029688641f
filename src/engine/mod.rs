//! External collaborators of the service.
//!
//! # Data Flow
//! ```text
//! service ──start/stop──────────────▶ Engine ──status watch──▶ service control task
//! reload  ──load_profile/select─────▶ Engine
//! pollers ──poll_traffic/…──────────▶ Engine
//! reload  ──query/remove selections─▶ ProfileStore
//! service ──profile/speed/show──────▶ NotificationSink
//! ```
//!
//! # Design Decisions
//! - Collaborators are trait objects so tests script them and the host binary
//!   plugs in `ControllerEngine`, `ConfigProfileStore` and `LogNotification`
//! - Engine and store calls are async; notification calls are plain methods
//!   because they are invoked from observer callbacks

pub mod controller;
pub mod notification;
pub mod profile;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::events::{Bandwidth, LogLine, ProcessStatus, Traffic};

pub use controller::ControllerEngine;
pub use notification::{LogNotification, NotificationSink};
pub use profile::{ActiveProfile, ConfigProfileStore, ProfileStore, StoreError};

/// Errors raised by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine refused or failed to parse a profile.
    #[error("{0}")]
    Load(String),

    /// The engine process is not running.
    #[error("engine is not running")]
    NotRunning,

    /// The engine process could not be spawned or signalled.
    #[error("engine process error: {0}")]
    Process(#[from] std::io::Error),

    /// The controller did not answer within the readiness window.
    #[error("engine controller not ready after {0} seconds")]
    NotReady(u64),

    /// Transport error talking to the controller.
    #[error("controller request failed: {0}")]
    Controller(#[from] reqwest::Error),

    #[error("invalid controller URL: {0}")]
    Url(#[from] url::ParseError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The proxy engine this service drives.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Start the engine process. Completion is reported through the status
    /// channel, not by the return value alone.
    async fn start(&self) -> EngineResult<()>;

    /// Stop the engine process.
    async fn stop(&self) -> EngineResult<()>;

    fn current_status(&self) -> ProcessStatus;

    /// Receiver following every status the engine reports, transient ones
    /// included.
    fn subscribe_status(&self) -> watch::Receiver<ProcessStatus>;

    async fn load_profile(&self, path: &Path) -> EngineResult<()>;

    /// Apply a proxy selection. `Ok(false)` means the engine rejected it.
    async fn set_selected_proxy(&self, group: &str, proxy: &str) -> EngineResult<bool>;

    async fn poll_traffic(&self) -> EngineResult<Traffic>;

    async fn poll_bandwidth(&self) -> EngineResult<Bandwidth>;

    /// Lines produced since the previous call.
    async fn poll_logs(&self) -> EngineResult<Vec<LogLine>>;
}
