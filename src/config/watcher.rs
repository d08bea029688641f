//! Configuration file watcher for hot profile reload.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::{ProfileConfig, ServiceConfig};

/// The part of the configuration that can change at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProfileBook {
    active_profile: Option<String>,
    profiles: Vec<ProfileConfig>,
}

impl ProfileBook {
    fn of(config: &ServiceConfig) -> Self {
        Self {
            active_profile: config.active_profile.clone(),
            profiles: config.profiles.clone(),
        }
    }
}

/// A watcher that monitors the configuration file for profile changes.
///
/// Editors often emit several events per save, so a new configuration is
/// only forwarded when its profile book differs from the last one seen.
pub struct ConfigWatcher {
    path: PathBuf,
    last: Mutex<ProfileBook>,
    update_tx: mpsc::UnboundedSender<ServiceConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher seeded with the configuration already in use.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path, current: &ServiceConfig) -> (Self, mpsc::UnboundedReceiver<ServiceConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                last: Mutex::new(ProfileBook::of(current)),
                update_tx,
            },
            update_rx,
        )
    }

    /// Reload the file and forward it if its profiles changed.
    ///
    /// Returns whether an update was sent.
    pub fn check(&self) -> bool {
        let config = match load_config(&self.path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config. Keeping current profiles.");
                return false;
            }
        };

        let book = ProfileBook::of(&config);
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if *last == book {
                tracing::debug!("Config changed outside the profile book, ignoring");
                return false;
            }
            *last = book;
        }

        tracing::info!(
            active_profile = ?config.active_profile,
            profiles = config.profiles.len(),
            "Profile configuration changed"
        );
        self.update_tx.send(config).is_ok()
    }

    /// Start watching the file in a background thread.
    ///
    /// The returned watcher must be kept alive for events to keep flowing.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        self.check();
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}
