//! Profile reload coordination.
//!
//! # Data Flow
//! ```text
//! STARTED transition / profile change ──request_reload──▶ queue (cap 1)
//!                                                           │
//!                                                           ▼
//!                                             ReloadWorker::run_job
//!                                  store ──▶ engine.load_profile ──▶ selections
//!                                                           │
//!                                     PROFILE_RELOADED or ERROR + engine stop
//! ```

pub mod coordinator;

pub use coordinator::{ReloadCoordinator, ReloadError, ReloadOutcome, ReloadRequest, ReloadWorker};
