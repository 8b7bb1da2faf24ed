//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 0. Validate (structural, no state)
//!   ↓  (per-stream lock held from here on)
//! 1. Load state (snapshot + upcast tail)
//!   ↓
//! 2. Handle command (pure decision logic, produces events)
//!   ↓
//! 3. Append with the observed version (optimistic concurrency check)
//!   ↓                       ↘ conflict: back to 1, bounded
//! 4. Publish committed events to the bus
//!   ↓
//! 5. Snapshot policy
//! ```
//!
//! Commands for one aggregate are serialized by a per-stream mutex; commands
//! for different aggregates run in parallel. The optimistic check still
//! guards against writers that do not share this dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use folio_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ExpectedVersion, StreamId};
use folio_events::{CodecError, Command, CommandEnvelope, Event, EventBus, EventEnvelope, UpcastError};

use crate::aggregate_runtime::{AggregateRuntime, Loaded, LoadError, capture};
use crate::config::EngineConfig;
use crate::event_store::{EventLog, EventStoreError, StoredEvent, UncommittedEvent};
use crate::snapshot::{SnapshotPolicy, SnapshotStore, SnapshotWriter};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Structural command failure; nothing was loaded.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Business rule violation; nothing was appended.
    #[error("rejected ({kind}): {message}")]
    Rejected { kind: String, message: String },

    /// The command targets an aggregate that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure after exhausting retries, or a stale
    /// caller-supplied expectation.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error(transparent)]
    Upcast(#[from] UpcastError),

    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("event log failure: {0}")]
    Store(EventStoreError),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency { .. } => DispatchError::Concurrency(value.to_string()),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::Rejected { kind, message } => DispatchError::Rejected { kind, message },
            DomainError::NotFound(what) => DispatchError::NotFound(what),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
        }
    }
}

impl From<LoadError> for DispatchError {
    fn from(value: LoadError) -> Self {
        match value {
            LoadError::Store(e) => e.into(),
            LoadError::Upcast(e) => DispatchError::Upcast(e),
            LoadError::Decode(e) => DispatchError::Decode(e),
            gap @ LoadError::Gap { .. } => {
                DispatchError::Store(EventStoreError::Backend(gap.to_string()))
            }
        }
    }
}

/// Result of a successful submit.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome<E> {
    /// Highest sequence number of the stream afterwards (`None`: still empty).
    pub new_version: Option<u64>,
    /// Events decided by this command, in append order.
    pub events: Vec<E>,
    /// The committed records (empty when nothing was decided).
    pub committed: Vec<StoredEvent>,
}

/// Lock table: one mutex per stream, held only while some submit uses it.
#[derive(Debug, Default)]
pub struct StreamLocks {
    table: Mutex<HashMap<StreamId, Arc<Mutex<()>>>>,
}

impl StreamLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a lease on the stream's mutex; the entry goes away with the last lease.
    pub fn lease(&self, stream: &StreamId) -> StreamLease<'_> {
        let lock = self.table().entry(stream.clone()).or_default().clone();
        StreamLease {
            locks: self,
            stream: stream.clone(),
            lock,
        }
    }

    /// Streams with a live lease.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<'_, HashMap<StreamId, Arc<Mutex<()>>>> {
        // The table only maps ids to mutexes; a poisoned guard still holds valid data.
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One caller's hold on a stream mutex.
#[derive(Debug)]
pub struct StreamLease<'a> {
    locks: &'a StreamLocks,
    stream: StreamId,
    lock: Arc<Mutex<()>>,
}

impl StreamLease<'_> {
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for StreamLease<'_> {
    fn drop(&mut self) {
        let mut table = self.locks.table();
        // Clones are only handed out under the table lock, so two means the table and us.
        let idle = table
            .get(&self.stream)
            .is_some_and(|held| Arc::ptr_eq(held, &self.lock) && Arc::strong_count(&self.lock) == 2);
        if idle {
            table.remove(&self.stream);
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// ## Error Semantics
///
/// - **Validation / rejection / not found**: returned as-is, nothing appended
/// - **Concurrency**: retried from a fresh load up to the configured bound
/// - **Bus errors**: logged; the log stays authoritative and catch-up redelivers
/// - **Snapshot errors**: logged by the background writer, never surfaced
#[derive(Debug)]
pub struct CommandDispatcher<L, S, B> {
    runtime: AggregateRuntime<L, S>,
    bus: B,
    locks: StreamLocks,
    policy: SnapshotPolicy,
    writer: Option<SnapshotWriter>,
    max_retries: u32,
}

impl<L, S, B> CommandDispatcher<L, S, B>
where
    L: EventLog,
    S: SnapshotStore + Clone + 'static,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        log: L,
        snapshots: S,
        bus: B,
        upcasters: Arc<folio_events::Upcasters>,
        config: &EngineConfig,
    ) -> Self {
        let policy = SnapshotPolicy::every(config.snapshot_every);
        let writer = policy
            .is_enabled()
            .then(|| SnapshotWriter::spawn(snapshots.clone()));

        Self {
            runtime: AggregateRuntime::new(log, snapshots, upcasters, config.log_page_size),
            bus,
            locks: StreamLocks::new(),
            policy,
            writer,
            max_retries: config.max_concurrency_retries,
        }
    }

    pub fn runtime(&self) -> &AggregateRuntime<L, S> {
        &self.runtime
    }

    pub fn log(&self) -> &L {
        self.runtime.log()
    }

    /// Wait until pending snapshot captures are stored.
    pub fn flush_snapshots(&self) {
        if let Some(writer) = &self.writer {
            writer.flush();
        }
    }

    /// Load an aggregate's current state (read-only).
    pub fn load<A>(&self, aggregate_id: &AggregateId) -> Result<Loaded<A>, DispatchError>
    where
        A: Aggregate + DeserializeOwned,
        A::Event: DeserializeOwned,
    {
        Ok(self.runtime.load::<A>(aggregate_id)?)
    }

    /// Submit a command, optionally with a caller expectation on the stream version.
    pub fn submit<A>(
        &self,
        envelope: impl Into<CommandEnvelope<A::Command>>,
    ) -> Result<SubmitOutcome<A::Event>, DispatchError>
    where
        A: Aggregate<Id = AggregateId, Error = DomainError> + Serialize + DeserializeOwned,
        A::Command: Command,
        A::Event: Event + Serialize + DeserializeOwned,
    {
        let envelope = envelope.into();
        let command = envelope.command();
        command.validate()?;

        let aggregate_id = command.target_aggregate_id().clone();
        let stream = StreamId::for_aggregate(A::AGGREGATE_TYPE, &aggregate_id);

        let lease = self.locks.lease(&stream);
        let _guard = lease.lock();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            // 1) Load
            let Loaded { mut state, .. } = self.runtime.load::<A>(&aggregate_id)?;
            let before = state.version();
            let current = before.checked_sub(1);

            if let Some(expected) = envelope.expected_version() {
                if !expected.matches(current) {
                    return Err(DispatchError::Concurrency(format!(
                        "{stream}: expected {expected:?}, actual {current:?}"
                    )));
                }
            }

            // 2) Decide
            let decided = state.handle(command).map_err(|err| {
                debug!(
                    stream = %stream,
                    command = command.command_type(),
                    error = %err,
                    "command rejected"
                );
                DispatchError::from(err)
            })?;
            if decided.is_empty() {
                return Ok(SubmitOutcome {
                    new_version: current,
                    events: vec![],
                    committed: vec![],
                });
            }

            // 3) Append with the observed version
            let batch = decided
                .iter()
                .map(|e| UncommittedEvent::from_typed(A::AGGREGATE_TYPE, aggregate_id.clone(), e))
                .collect::<Result<Vec<_>, _>>()?;

            let committed = match self
                .runtime
                .log()
                .append(&stream, ExpectedVersion::after(before), batch)
            {
                Ok(committed) => committed,
                Err(EventStoreError::Concurrency { actual, .. }) if attempt <= self.max_retries => {
                    debug!(
                        stream = %stream,
                        attempt,
                        observed = ?current,
                        actual = ?actual,
                        "concurrency conflict; retrying"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            // 4) Publish (append order)
            for stored in &committed {
                if let Err(err) = self.bus.publish(stored.to_envelope()) {
                    warn!(
                        stream = %stream,
                        sequence = stored.sequence_number,
                        error = ?err,
                        "event publication failed; catch-up will redeliver"
                    );
                }
            }

            // 5) Snapshot policy
            for ev in &decided {
                state.apply(ev);
            }
            self.maybe_capture(&state, before);

            return Ok(SubmitOutcome {
                new_version: committed.last().map(|e| e.sequence_number),
                events: decided,
                committed,
            });
        }
    }

    fn maybe_capture<A>(&self, state: &A, before: u64)
    where
        A: Aggregate<Id = AggregateId> + Serialize,
    {
        let Some(writer) = &self.writer else {
            return;
        };
        if !self.policy.should_capture(before, state.version()) {
            return;
        }
        match capture(state) {
            Ok(snapshot) => writer.submit(snapshot),
            Err(err) => warn!(aggregate_type = A::AGGREGATE_TYPE, error = %err, "snapshot capture failed"),
        }
    }
}
