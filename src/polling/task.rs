//! A single poll loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use crate::engine::{Engine, EngineResult};
use crate::events::{EventDispatcher, EventEnvelope, EventKind};
use crate::lifecycle::status::ProcessStateTracker;

/// Periodic sampler for one pollable kind.
///
/// `generation` is compared with the controller's current generation for the
/// kind, under the same lock the controller takes to stop the loop, right
/// before a sample is emitted. A stopped loop can therefore never emit.
pub(crate) struct PollTask {
    pub kind: EventKind,
    pub generation: u64,
    pub current: Arc<Mutex<u64>>,
    pub period: Duration,
    pub engine: Arc<dyn Engine>,
    pub dispatcher: EventDispatcher,
    pub status: Arc<ProcessStateTracker>,
}

impl PollTask {
    pub async fn run(self) {
        tracing::debug!(kind = %self.kind, generation = self.generation, "Poll loop started");

        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if !self.is_current() {
                break;
            }
            if !self.status.is_started() {
                continue;
            }

            match self.sample().await {
                Ok(events) => {
                    if !self.publish(events) {
                        break;
                    }
                }
                Err(e) => tracing::warn!(kind = %self.kind, error = %e, "Poll failed"),
            }
        }

        tracing::debug!(kind = %self.kind, generation = self.generation, "Poll loop exited");
    }

    async fn sample(&self) -> EngineResult<Vec<EventEnvelope>> {
        Ok(match self.kind {
            EventKind::Traffic => vec![EventEnvelope::Traffic(self.engine.poll_traffic().await?)],
            EventKind::Bandwidth => vec![EventEnvelope::Bandwidth(self.engine.poll_bandwidth().await?)],
            EventKind::Log => self
                .engine
                .poll_logs()
                .await?
                .into_iter()
                .map(EventEnvelope::Log)
                .collect(),
            _ => Vec::new(),
        })
    }

    fn is_current(&self) -> bool {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) == self.generation
    }

    /// Emit `events` unless this loop has been superseded. Returns whether
    /// the loop is still current.
    fn publish(&self, events: Vec<EventEnvelope>) -> bool {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != self.generation {
            tracing::debug!(kind = %self.kind, "Discarding sample from stopped poll loop");
            return false;
        }
        if !self.status.is_started() {
            return true;
        }

        for event in events {
            self.dispatcher.emit(event);
        }
        true
    }
}
