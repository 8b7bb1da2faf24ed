//! Saga / process manager mechanics (framework only, no business rules).
//!
//! - Explicit state machines per saga, as an enumerated `State`
//! - Pure transitions: `(state, input) → (state, commands)`
//! - Compensating actions expressed as commands, never as callbacks
//! - Saga state is a read model over the log, rebuildable like a projection
//!
//! Infra runs sagas: it correlates events to instances, stores instances,
//! evaluates timeouts and hands emitted commands to an executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{EventEnvelope, ProjectionApplyError};

/// One running (or finished) saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInstance<S> {
    pub saga_id: String,
    pub correlation_key: String,
    pub state: S,
    /// Human-readable names of the steps still awaited.
    pub pending_steps: Vec<String>,
    /// Timestamp of the starting event; timeouts are measured from here.
    pub started_at: DateTime<Utc>,
}

/// Result of a transition: the next state and the commands to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<S, C> {
    pub state: S,
    pub pending_steps: Vec<String>,
    pub commands: Vec<C>,
}

impl<S, C> Transition<S, C> {
    pub fn to(state: S) -> Self {
        Self {
            state,
            pending_steps: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn awaiting(mut self, step: impl Into<String>) -> Self {
        self.pending_steps.push(step.into());
        self
    }

    pub fn sending(mut self, command: C) -> Self {
        self.commands.push(command);
        self
    }
}

/// Saga contract (mechanics only).
pub trait Saga: Send + Sync + 'static {
    type State: Clone + PartialEq + core::fmt::Debug + Send + Sync + 'static;
    type Command: Clone + core::fmt::Debug + Send + Sync + 'static;

    /// Stable saga type identifier (e.g. "saga.book_transfer").
    fn saga_type() -> &'static str;

    /// Correlation key of an event this saga cares about, `None` otherwise.
    fn correlate(envelope: &EventEnvelope<JsonValue>) -> Result<Option<String>, ProjectionApplyError>;

    /// Transition for an event that opens a new instance.
    fn start(
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<Transition<Self::State, Self::Command>>, ProjectionApplyError>;

    /// Transition of a live instance in response to a correlated event.
    fn react(
        instance: &SagaInstance<Self::State>,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<Transition<Self::State, Self::Command>>, ProjectionApplyError>;

    /// Transition when the instance outlived its deadline (`now` is the tick time).
    fn on_timeout(
        instance: &SagaInstance<Self::State>,
        now: DateTime<Utc>,
    ) -> Option<Transition<Self::State, Self::Command>>;

    /// State to move to once every command of a transition was accepted.
    fn dispatched(_state: &Self::State) -> Option<Self::State> {
        None
    }

    /// Terminal states are never timed out and ignore further events.
    fn is_terminal(state: &Self::State) -> bool;

    /// Deterministic instance id for a correlation key.
    fn saga_id(correlation_key: &str) -> String {
        format!("{}-{}", Self::saga_type(), correlation_key)
    }
}
