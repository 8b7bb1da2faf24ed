use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use folio_events::{EventBus, EventEnvelope, Subscription};

use super::delivery::DeliveryPipeline;
use crate::event_store::EventLog;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Background delivery loop.
///
/// - Subscribes to the bus before catching up, so nothing committed in between is lost
/// - Catches up from the pipeline checkpoint on start and whenever the bus is idle
/// - Feeds bus messages to the pipeline (at-least-once; handlers are idempotent)
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    pub fn spawn<L, B>(name: &'static str, bus: B, pipeline: Arc<DeliveryPipeline<L>>) -> WorkerHandle
    where
        L: EventLog + 'static,
        B: EventBus<EventEnvelope<JsonValue>> + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, &pipeline))
            .expect("failed to spawn projection worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn worker_loop<L: EventLog>(
    name: &'static str,
    sub: Subscription<EventEnvelope<JsonValue>>,
    shutdown_rx: mpsc::Receiver<()>,
    pipeline: &DeliveryPipeline<L>,
) {
    let tick = Duration::from_millis(250);

    catch_up(name, pipeline);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(envelope) => pipeline.deliver(envelope),
            Err(RecvTimeoutError::Timeout) => catch_up(name, pipeline),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker = name, "projection worker stopped");
}

fn catch_up<L: EventLog>(name: &'static str, pipeline: &DeliveryPipeline<L>) {
    if let Err(err) = pipeline.catch_up() {
        warn!(worker = name, error = %err, "catch-up failed, retrying on next tick");
    }
}

/// Periodically evaluates saga deadlines.
#[derive(Debug)]
pub struct TickWorker;

impl TickWorker {
    pub fn spawn<F>(name: &'static str, every: Duration, mut tick: F) -> WorkerHandle
    where
        F: FnMut(chrono::DateTime<Utc>) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(every) {
                        Err(RecvTimeoutError::Timeout) => tick(Utc::now()),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn tick worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
