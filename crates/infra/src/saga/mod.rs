//! Saga infrastructure: instance bookkeeping, timeouts and command execution.
//!
//! A [`SagaCoordinator`] is an event handler like any projection: it keeps one
//! [`SagaInstance`] per correlation key, guards each stream with a cursor and
//! can be rebuilt from the log. Commands emitted by transitions go to a
//! [`CommandExecutor`] after the instance lock is released; during a rebuild
//! they are not issued again.

pub mod book_transfer;

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use folio_core::StreamId;
use folio_events::{EventEnvelope, EventHandler, ProjectionApplyError, Saga, SagaInstance, Transition, Upcasters};

use crate::event_store::EventLog;
use crate::projections::cursor_store::{CursorCheck, check_sequence};
use crate::projections::{Rebuildable, ReplayError, ReplayStats, rebuild};

pub use book_transfer::{BookTransferSaga, BookTransferState, TransferPhase};

/// Sends saga commands to the write side.
pub trait CommandExecutor<C>: Send + Sync {
    type Error: core::fmt::Display;

    fn execute(&self, command: C) -> Result<(), Self::Error>;
}

impl<C, F, E> CommandExecutor<C> for F
where
    F: Fn(C) -> Result<(), E> + Send + Sync,
    E: core::fmt::Display,
{
    type Error = E;

    fn execute(&self, command: C) -> Result<(), E> {
        self(command)
    }
}

struct Inner<St> {
    instances: BTreeMap<String, SagaInstance<St>>,
    cursors: HashMap<StreamId, u64>,
}

impl<St> Default for Inner<St> {
    fn default() -> Self {
        Self {
            instances: BTreeMap::new(),
            cursors: HashMap::new(),
        }
    }
}

/// Runs one saga type.
pub struct SagaCoordinator<S: Saga, X> {
    executor: X,
    timeout: Duration,
    replaying: AtomicBool,
    inner: Mutex<Inner<S::State>>,
    _saga: PhantomData<fn() -> S>,
}

impl<S, X> SagaCoordinator<S, X>
where
    S: Saga,
    X: CommandExecutor<S::Command>,
{
    pub fn new(executor: X, timeout: Duration) -> Self {
        Self {
            executor,
            timeout,
            replaying: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
            _saga: PhantomData,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn instance(&self, correlation_key: &str) -> Option<SagaInstance<S::State>> {
        self.lock().instances.get(correlation_key).cloned()
    }

    /// Every instance, ordered by correlation key.
    pub fn instances(&self) -> Vec<SagaInstance<S::State>> {
        self.lock().instances.values().cloned().collect()
    }

    /// Instances that have not reached a terminal state.
    pub fn active(&self) -> Vec<SagaInstance<S::State>> {
        self.lock()
            .instances
            .values()
            .filter(|i| !S::is_terminal(&i.state))
            .cloned()
            .collect()
    }

    /// Apply one committed event, issuing the commands its transition emits.
    pub fn observe(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionApplyError> {
        let issue = !self.replaying.load(Ordering::SeqCst);
        let Some((key, transition)) = self.step(envelope)? else {
            return Ok(());
        };
        if issue {
            self.issue(&key, transition);
        }
        Ok(())
    }

    /// Time out every live instance whose deadline is at or before `now`.
    ///
    /// Returns how many instances timed out.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        let fired: Vec<(String, Transition<S::State, S::Command>)> = {
            let mut inner = self.lock();
            let mut fired = Vec::new();
            for (key, instance) in inner.instances.iter_mut() {
                if S::is_terminal(&instance.state) || !self.expired(instance, now) {
                    continue;
                }
                let Some(transition) = S::on_timeout(instance, now) else {
                    continue;
                };
                info!(
                    saga = S::saga_type(),
                    saga_id = %instance.saga_id,
                    pending = ?instance.pending_steps,
                    "saga timed out"
                );
                instance.state = transition.state.clone();
                instance.pending_steps = transition.pending_steps.clone();
                fired.push((key.clone(), transition));
            }
            fired
        };

        let count = fired.len();
        for (key, transition) in fired {
            self.issue(&key, transition);
        }
        count
    }

    /// Reset and replay the whole log without issuing any command.
    pub fn rebuild<L: EventLog>(
        &self,
        log: &L,
        upcasters: &Upcasters,
        page_size: usize,
    ) -> Result<ReplayStats, ReplayError> {
        self.replaying.store(true, Ordering::SeqCst);
        let result = rebuild(log, upcasters, page_size, self);
        self.replaying.store(false, Ordering::SeqCst);
        result
    }

    fn expired(&self, instance: &SagaInstance<S::State>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(instance.started_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= self.timeout)
    }

    /// Cursor check, correlation and state change, all under the lock.
    fn step(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<(String, Transition<S::State, S::Command>)>, ProjectionApplyError> {
        let stream = envelope.stream_id();
        let seq = envelope.sequence_number();
        let mut inner = self.lock();

        let last = inner.cursors.get(stream).copied();
        match check_sequence(last, seq) {
            CursorCheck::Duplicate => return Ok(None),
            CursorCheck::Gap => {
                return Err(ProjectionApplyError::SequenceGap {
                    stream: stream.clone(),
                    last,
                    found: seq,
                });
            }
            CursorCheck::Next => {}
        }

        let outcome = match S::correlate(envelope)? {
            None => None,
            Some(key) => match inner.instances.get_mut(&key) {
                Some(instance) if S::is_terminal(&instance.state) => None,
                Some(instance) => S::react(instance, envelope)?.map(|transition| {
                    debug!(saga = S::saga_type(), saga_id = %instance.saga_id, state = ?transition.state, "saga advanced");
                    instance.state = transition.state.clone();
                    instance.pending_steps = transition.pending_steps.clone();
                    (key, transition)
                }),
                None => S::start(envelope)?.map(|transition| {
                    let instance = SagaInstance {
                        saga_id: S::saga_id(&key),
                        correlation_key: key.clone(),
                        state: transition.state.clone(),
                        pending_steps: transition.pending_steps.clone(),
                        started_at: envelope.timestamp(),
                    };
                    info!(saga = S::saga_type(), saga_id = %instance.saga_id, "saga started");
                    inner.instances.insert(key.clone(), instance);
                    (key, transition)
                }),
            },
        };

        inner.cursors.insert(stream.clone(), seq);
        Ok(outcome)
    }

    fn issue(&self, key: &str, transition: Transition<S::State, S::Command>) {
        if transition.commands.is_empty() {
            return;
        }

        let mut accepted = true;
        for command in transition.commands {
            if let Err(err) = self.executor.execute(command) {
                accepted = false;
                warn!(saga = S::saga_type(), correlation_key = key, error = %err, "saga command failed");
            }
        }
        if !accepted {
            return;
        }

        let Some(next) = S::dispatched(&transition.state) else {
            return;
        };
        let mut inner = self.lock();
        if let Some(instance) = inner.instances.get_mut(key) {
            // Only if nothing moved the instance on in the meantime.
            if instance.state == transition.state {
                instance.state = next;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<S::State>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<S, X> EventHandler for SagaCoordinator<S, X>
where
    S: Saga,
    X: CommandExecutor<S::Command>,
{
    fn name(&self) -> &str {
        S::saga_type()
    }

    fn handles(&self, _event_type: &str) -> bool {
        // Correlation decides; the event type alone does not.
        true
    }

    fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionApplyError> {
        self.observe(envelope)
    }

    fn last_applied(&self, stream_id: &StreamId) -> Option<u64> {
        self.lock().cursors.get(stream_id).copied()
    }
}

impl<S, X> Rebuildable for SagaCoordinator<S, X>
where
    S: Saga,
    X: CommandExecutor<S::Command>,
{
    fn reset(&self) {
        let mut inner = self.lock();
        inner.instances.clear();
        inner.cursors.clear();
    }
}
