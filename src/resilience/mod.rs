//! Resilience helpers.
//!
//! # Data Flow
//! ```text
//! Engine start:
//!     spawn process
//!     → probe controller
//!     → on failure: backoff.rs delay, probe again until the readiness deadline
//! ```
//!
//! # Design Decisions
//! - Jittered backoff so restarts of several hosts do not probe in lockstep
//! - The deadline belongs to the caller; backoff only computes delays

pub mod backoff;
