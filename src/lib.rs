//! Engine lifecycle and event fan-out service library

pub mod admin;
pub mod config;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod observability;
pub mod polling;
pub mod reload;
pub mod resilience;
pub mod service;

pub use config::schema::ServiceConfig;
pub use lifecycle::Shutdown;
pub use service::{EngineService, ServiceSignal};
