//! Delivery of committed events to the registered read-side handlers.
//!
//! The pipeline owns the explicit handler table built at startup. For every
//! event it upcasts once, then hands the current-revision envelope to each
//! handler with bounded, exponentially backed-off retries. A handler that keeps
//! failing on a stream is parked for that stream only ("degraded"): later
//! events of the stream are held back for it while every other
//! (handler, stream) pair keeps flowing. Missed or held-back events are never
//! buffered; they are re-read from the log.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use folio_core::StreamId;
use folio_events::{EventEnvelope, EventHandler, ProjectionApplyError, Upcasters};

use crate::config::EngineConfig;
use crate::event_store::{EventLog, EventStoreError};

/// Bounded exponential backoff for handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.projection_max_attempts.max(1),
            initial_backoff: config.projection_backoff,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// A (handler, stream) pair parked after repeated failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedStream {
    pub handler: String,
    pub stream: StreamId,
    /// Sequence number of the event that could not be applied.
    pub sequence_number: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineHealth {
    /// Global position the next catch-up starts from.
    pub checkpoint: u64,
    pub degraded: Vec<DegradedStream>,
}

impl PipelineHealth {
    pub fn is_healthy(&self) -> bool {
        self.degraded.is_empty()
    }
}

#[derive(Debug, Default)]
struct DeliveryState {
    checkpoint: u64,
    degraded: BTreeMap<(String, StreamId), DegradedStream>,
}

pub struct DeliveryPipeline<L> {
    log: L,
    upcasters: Arc<Upcasters>,
    handlers: Vec<Arc<dyn EventHandler>>,
    retry: RetryPolicy,
    page_size: usize,
    state: Mutex<DeliveryState>,
    // One delivery at a time keeps per-stream order across bus and catch-up.
    delivering: Mutex<()>,
}

impl<L: EventLog> DeliveryPipeline<L> {
    pub fn new(log: L, upcasters: Arc<Upcasters>, config: &EngineConfig) -> Self {
        Self {
            log,
            upcasters,
            handlers: Vec::new(),
            retry: RetryPolicy::from_config(config),
            page_size: config.log_page_size,
            state: Mutex::new(DeliveryState::default()),
            delivering: Mutex::new(()),
        }
    }

    /// Register a handler. Registration happens once, before delivery starts.
    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handlers(&self) -> &[Arc<dyn EventHandler>] {
        &self.handlers
    }

    pub fn health(&self) -> PipelineHealth {
        let state = self.state();
        PipelineHealth {
            checkpoint: state.checkpoint,
            degraded: state.degraded.values().cloned().collect(),
        }
    }

    pub fn is_degraded(&self, handler: &str, stream: &StreamId) -> bool {
        self.state()
            .degraded
            .contains_key(&(handler.to_string(), stream.clone()))
    }

    /// Deliver one committed event as read from the log or the bus.
    pub fn deliver(&self, envelope: EventEnvelope<JsonValue>) {
        let _delivering = self.delivering.lock().unwrap_or_else(|p| p.into_inner());
        self.deliver_locked(envelope);
    }

    /// Read the log from the checkpoint to its current end.
    ///
    /// Returns the number of events delivered.
    pub fn catch_up(&self) -> Result<u64, EventStoreError> {
        let _delivering = self.delivering.lock().unwrap_or_else(|p| p.into_inner());
        let from = self.state().checkpoint;

        let mut delivered = 0;
        for stored in self.log.read_all(from, self.page_size) {
            self.deliver_locked(stored?.into_envelope());
            delivered += 1;
        }

        if delivered > 0 {
            debug!(from, delivered, "catch-up delivered events");
        }
        Ok(delivered)
    }

    /// Catch up until the checkpoint reaches the end of the log.
    pub fn settle(&self) -> Result<u64, EventStoreError> {
        let mut total = 0;
        loop {
            let delivered = self.catch_up()?;
            if delivered == 0 {
                return Ok(total);
            }
            total += delivered;
        }
    }

    /// Un-park a (handler, stream) pair and replay the stream to it from the
    /// handler's own cursor.
    ///
    /// Returns whether the pair is healthy afterwards.
    pub fn clear_degraded(&self, handler: &str, stream: &StreamId) -> Result<bool, EventStoreError> {
        let _delivering = self.delivering.lock().unwrap_or_else(|p| p.into_inner());

        let removed = self
            .state()
            .degraded
            .remove(&(handler.to_string(), stream.clone()));
        if removed.is_none() {
            return Ok(true);
        }
        let Some(target) = self.handlers.iter().find(|h| h.name() == handler).cloned() else {
            return Ok(true);
        };
        info!(handler, stream = %stream, "retrying degraded stream");

        let from = target.last_applied(stream).map_or(0, |last| last + 1);
        let upto = self.state().checkpoint;
        for stored in self.log.read(stream, from, self.page_size) {
            let stored = stored?;
            if stored.global_position >= upto {
                break;
            }
            let Some(envelope) = self.upcast(stored.into_envelope()) else {
                return Ok(false);
            };
            if !self.apply_with_retry(target.as_ref(), &envelope) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn deliver_locked(&self, envelope: EventEnvelope<JsonValue>) {
        let position = envelope.global_position();
        let stream = envelope.stream_id().clone();

        if let Some(envelope) = self.upcast(envelope) {
            for handler in &self.handlers {
                if self.is_degraded(handler.name(), &stream) {
                    continue;
                }
                self.fill_gap(handler.as_ref(), &envelope);
                if self.is_degraded(handler.name(), &stream) {
                    continue;
                }
                self.apply_with_retry(handler.as_ref(), &envelope);
            }
        }

        // Only contiguous progress moves the checkpoint; an event that arrived
        // ahead of it is seen again by the next catch-up and skipped there.
        let mut state = self.state();
        if position == state.checkpoint {
            state.checkpoint += 1;
        }
    }

    /// Upcast once for all handlers; a failure parks the stream for every handler.
    fn upcast(&self, envelope: EventEnvelope<JsonValue>) -> Option<EventEnvelope<JsonValue>> {
        let stream = envelope.stream_id().clone();
        let sequence = envelope.sequence_number();
        match self.upcasters.upcast_envelope(envelope) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                error!(stream = %stream, sequence, error = %err, "upcast failed, stream held back");
                let mut state = self.state();
                for handler in &self.handlers {
                    state
                        .degraded
                        .entry((handler.name().to_string(), stream.clone()))
                        .or_insert_with(|| DegradedStream {
                            handler: handler.name().to_string(),
                            stream: stream.clone(),
                            sequence_number: sequence,
                            reason: err.to_string(),
                        });
                }
                None
            }
        }
    }

    /// Re-read from the log whatever the handler missed on this stream.
    fn fill_gap(&self, handler: &dyn EventHandler, envelope: &EventEnvelope<JsonValue>) {
        let stream = envelope.stream_id();
        let from = handler.last_applied(stream).map_or(0, |last| last + 1);
        if from >= envelope.sequence_number() {
            return;
        }

        debug!(handler = handler.name(), stream = %stream, from, to = envelope.sequence_number(), "filling gap from log");
        for stored in self.log.read(stream, from, self.page_size) {
            let stored = match stored {
                Ok(stored) => stored,
                Err(err) => {
                    // The event itself then fails with a gap and is retried.
                    warn!(handler = handler.name(), stream = %stream, error = %err, "gap read failed");
                    return;
                }
            };
            if stored.sequence_number >= envelope.sequence_number() {
                return;
            }
            let Some(missed) = self.upcast(stored.into_envelope()) else {
                return;
            };
            if !self.apply_with_retry(handler, &missed) {
                return;
            }
        }
    }

    /// Returns `false` when the pair ended up degraded.
    fn apply_with_retry(&self, handler: &dyn EventHandler, envelope: &EventEnvelope<JsonValue>) -> bool {
        let mut attempt = 1;
        loop {
            let err: ProjectionApplyError = match handler.handle(envelope) {
                Ok(()) => return true,
                Err(err) => err,
            };

            if attempt >= self.retry.max_attempts {
                error!(
                    handler = handler.name(),
                    stream = %envelope.stream_id(),
                    sequence = envelope.sequence_number(),
                    attempt,
                    error = %err,
                    "handler failing, stream degraded"
                );
                let key = (handler.name().to_string(), envelope.stream_id().clone());
                self.state().degraded.insert(
                    key,
                    DegradedStream {
                        handler: handler.name().to_string(),
                        stream: envelope.stream_id().clone(),
                        sequence_number: envelope.sequence_number(),
                        reason: err.to_string(),
                    },
                );
                return false;
            }

            warn!(
                handler = handler.name(),
                stream = %envelope.stream_id(),
                sequence = envelope.sequence_number(),
                attempt,
                error = %err,
                "handler failed, retrying"
            );
            thread::sleep(self.retry.backoff(attempt));
            attempt += 1;
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
