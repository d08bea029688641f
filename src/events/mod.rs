//! Runtime event model and fan-out.
//!
//! # Data Flow
//! ```text
//! poll loops / lifecycle / reload worker
//!     → dispatcher.rs (emit: Arc<EventEnvelope>)
//!     → registry.rs snapshot (interest-gated for pollable kinds)
//!     → observer.rs per-observer queue → worker → EventObserver::on_event
//!
//! registry.rs mutation
//!     → effective mask recomputed under the write lock
//!     → watch channel → polling controller reconciles pollers
//! ```
//!
//! # Design Decisions
//! - Only TRAFFIC, BANDWIDTH and LOG are gated by interest masks
//! - One bounded queue per observer; a full queue sheds samples for that
//!   observer only, while control events evict the oldest queued sample
//! - Envelopes are immutable and shared by `Arc`

pub mod dispatcher;
pub mod observer;
pub mod registry;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use crate::lifecycle::status::ProcessStatus;
pub use dispatcher::EventDispatcher;
pub use observer::{ChannelObserver, EventObserver, EventReceiver};
pub use registry::SubscriptionRegistry;

/// Discriminant of every event the service can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Process,
    ProfileReloaded,
    Traffic,
    Bandwidth,
    Log,
    Error,
}

impl EventKind {
    /// Kinds whose production needs a background poll loop.
    pub const POLLABLE: [EventKind; 3] = [EventKind::Bandwidth, EventKind::Traffic, EventKind::Log];

    pub const ALL: [EventKind; 6] = [
        EventKind::Process,
        EventKind::ProfileReloaded,
        EventKind::Traffic,
        EventKind::Bandwidth,
        EventKind::Log,
        EventKind::Error,
    ];

    pub fn is_pollable(self) -> bool {
        matches!(self, EventKind::Traffic | EventKind::Bandwidth | EventKind::Log)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Process => "process",
            EventKind::ProfileReloaded => "profile_reloaded",
            EventKind::Traffic => "traffic",
            EventKind::Bandwidth => "bandwidth",
            EventKind::Log => "log",
            EventKind::Error => "error",
        }
    }

    fn bit(self) -> u8 {
        match self {
            EventKind::Process => 1 << 0,
            EventKind::ProfileReloaded => 1 << 1,
            EventKind::Traffic => 1 << 2,
            EventKind::Bandwidth => 1 << 3,
            EventKind::Log => 1 << 4,
            EventKind::Error => 1 << 5,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown event kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// Set of event kinds an observer is interested in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventMask(u8);

impl EventMask {
    pub const EMPTY: EventMask = EventMask(0);

    const VALID_BITS: u8 = 0b0011_1111;
    const POLLABLE_BITS: u8 = (1 << 2) | (1 << 3) | (1 << 4);

    /// Build a mask from raw bits, silently dropping bits that name no kind.
    pub fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::VALID_BITS)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn of<I: IntoIterator<Item = EventKind>>(kinds: I) -> Self {
        kinds.into_iter().fold(Self::EMPTY, |mask, kind| mask.with(kind))
    }

    pub fn with(self, kind: EventKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub fn without(self, kind: EventKind) -> Self {
        Self(self.0 & !kind.bit())
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn union(self, other: EventMask) -> Self {
        Self(self.0 | other.0)
    }

    /// Restrict the mask to the kinds that need a poll loop.
    pub fn pollable(self) -> Self {
        Self(self.0 & Self::POLLABLE_BITS)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<EventKind> for EventMask {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        Self::of(iter)
    }
}

impl Serialize for EventMask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// Upload/download speed sample, bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub up: u64,
    pub down: u64,
}

/// Total bytes transferred since the engine started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Silent,
}

/// One line of engine output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ProfileLoad,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub message: String,
}

impl ErrorEvent {
    pub fn profile_load(message: impl Into<String>) -> Self {
        Self {
            error_type: ErrorType::ProfileLoad,
            message: message.into(),
        }
    }
}

/// Outcome of a successful reload job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileReloaded {
    /// Display name of the profile now loaded in the engine.
    pub profile: String,
    /// Proxy groups whose stored selection the engine rejected.
    pub rejected: Vec<String>,
}

/// A single emitted event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventEnvelope {
    Process(ProcessStatus),
    ProfileReloaded(ProfileReloaded),
    Traffic(Traffic),
    Bandwidth(Bandwidth),
    Log(LogLine),
    Error(ErrorEvent),
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        match self {
            EventEnvelope::Process(_) => EventKind::Process,
            EventEnvelope::ProfileReloaded(_) => EventKind::ProfileReloaded,
            EventEnvelope::Traffic(_) => EventKind::Traffic,
            EventEnvelope::Bandwidth(_) => EventKind::Bandwidth,
            EventEnvelope::Log(_) => EventKind::Log,
            EventEnvelope::Error(_) => EventKind::Error,
        }
    }
}
