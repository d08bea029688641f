//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Status (status.rs):
//!     Engine reports status → Tracker stores settled value → Service sequences side effects
//!
//! Shutdown (shutdown.rs):
//!     destroy() / engine STOPPED → trigger → Poll controller, watcher and admin exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → destroy the service
//!     SIGHUP → request a profile reload
//!     PowerState → narrow or restore the built-in observer's interest
//! ```
//!
//! # Design Decisions
//! - Only STARTED and STOPPED are ever stored
//! - Shutdown is latched so a late waiter still observes it

pub mod shutdown;
pub mod signals;
pub mod status;

pub use shutdown::Shutdown;
pub use signals::PowerState;
pub use status::{ProcessStateTracker, ProcessStatus};
