//! Metrics collection and exposition.
//!
//! # Metrics
//! - `engine_events_emitted_total` (counter): events emitted, by kind
//! - `engine_events_dropped_total` (counter): events dropped for a full observer queue, by kind
//! - `engine_observers` (gauge): live observer registrations
//! - `engine_pollers_running` (gauge): 1 while the poll loop for a kind runs
//! - `engine_reloads_total` (counter): reload jobs, by outcome
//! - `engine_process_status` (gauge): 1=started, 0=stopped

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::events::{EventKind, ProcessStatus};

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_event_emitted(kind: EventKind) {
    metrics::counter!("engine_events_emitted_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_event_dropped(kind: EventKind) {
    metrics::counter!("engine_events_dropped_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_observers(count: usize) {
    metrics::gauge!("engine_observers").set(count as f64);
}

pub fn record_poller(kind: EventKind, running: bool) {
    metrics::gauge!("engine_pollers_running", "kind" => kind.as_str()).set(if running { 1.0 } else { 0.0 });
}

pub fn record_reload(outcome: &'static str) {
    metrics::counter!("engine_reloads_total", "outcome" => outcome).increment(1);
}

pub fn record_process_status(status: ProcessStatus) {
    let value = if status == ProcessStatus::Started { 1.0 } else { 0.0 };
    metrics::gauge!("engine_process_status").set(value);
}
