//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the engine service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Built-in observer and delivery queue settings.
    pub service: ServiceSection,

    /// Poll loop periods.
    pub polling: PollingConfig,

    /// Engine process and controller settings.
    pub engine: EngineConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Id of the profile the engine should run.
    pub active_profile: Option<String>,

    /// Profiles known to the in-memory profile store.
    pub profiles: Vec<ProfileConfig>,
}

/// Settings of the service itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Registration id of the service's own observer.
    pub id: String,

    /// Capacity of each observer's delivery queue.
    pub observer_queue_capacity: usize,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            id: "engine-service".to_string(),
            observer_queue_capacity: 256,
        }
    }
}

/// Poll loop periods in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub traffic_interval_ms: u64,
    pub bandwidth_interval_ms: u64,
    pub log_interval_ms: u64,
}

impl PollingConfig {
    pub fn traffic_interval(&self) -> Duration {
        Duration::from_millis(self.traffic_interval_ms)
    }

    pub fn bandwidth_interval(&self) -> Duration {
        Duration::from_millis(self.bandwidth_interval_ms)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            traffic_interval_ms: 1000,
            bandwidth_interval_ms: 1000,
            log_interval_ms: 500,
        }
    }
}

/// Engine process and REST controller settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable.
    pub command: String,

    /// Arguments passed to the executable.
    pub args: Vec<String>,

    /// Working directory of the engine process.
    pub working_dir: Option<String>,

    /// Base URL of the engine's external controller.
    pub controller_url: String,

    /// Bearer secret expected by the controller.
    pub secret: Option<String>,

    /// How long to wait for the controller after spawning the process.
    pub ready_timeout_secs: u64,

    /// Engine output lines kept until the log poller drains them.
    pub log_buffer_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "clash".to_string(),
            args: Vec::new(),
            working_dir: None,
            controller_url: "http://127.0.0.1:9090".to_string(),
            secret: None,
            ready_timeout_secs: 10,
            log_buffer_lines: 1024,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind_address: String,
    /// Bearer token required on every admin request when set.
    pub api_key: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:9091".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default level for this crate's targets.
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9100".to_string(),
        }
    }
}

/// One profile: an engine configuration file plus remembered selections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProfileConfig {
    pub id: String,
    pub name: String,
    /// Path of the engine configuration file.
    pub file: String,
    /// Proxy group → selected proxy name.
    #[serde(default)]
    pub selections: BTreeMap<String, String>,
}
