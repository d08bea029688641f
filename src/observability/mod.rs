//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via `metrics`)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Observer ids, event kinds and profile ids are structured fields
//! - Metric updates are fire-and-forget; with no recorder installed they are no-ops
//! - `RUST_LOG` overrides the configured level

pub mod logging;
pub mod metrics;
