//! Per-kind engine polling.
//!
//! # Data Flow
//! ```text
//! registry mask watch ─┐
//! acquire / release ───┼─▶ controller.rs reconcile
//! lifecycle (started) ─┘        │ edge: start / stop
//!                               ▼
//!                   task.rs loop (one per kind)
//!                   tick → Engine::poll_* → generation check → dispatcher.emit
//! ```
//!
//! # Design Decisions
//! - Nothing polls while the engine is stopped
//! - A generation number per kind guards emission, so a sample taken by a
//!   loop that was stopped meanwhile is dropped
//! - Poll failures are logged and the loop keeps its schedule

pub mod controller;
mod task;

pub use controller::{PollController, StoppedPollers};
