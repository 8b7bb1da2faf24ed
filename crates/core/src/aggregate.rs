//! Aggregate root traits for event-sourced domain models.

use crate::error::{DomainError, DomainResult};
use crate::id::AggregateId;

/// Aggregate root marker + minimal interface.
///
/// This is intentionally small so domain modules can decide how they model state
/// transitions without bringing in any infrastructure concerns.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Number of events folded into this state.
    ///
    /// Streams number their events from 0, so a version of `n` means the last
    /// applied event had sequence number `n - 1` and the next one will get `n`.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a stream append.
///
/// Expectations are phrased in terms of the stream's highest sequence number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stream to be empty.
    NoStream,
    /// Require the stream's highest sequence number to be exactly this value.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation matching an aggregate that has folded `version` events.
    pub fn after(version: u64) -> Self {
        match version {
            0 => ExpectedVersion::NoStream,
            v => ExpectedVersion::Exact(v - 1),
        }
    }

    /// `current` is the stream's highest sequence number, `None` when empty.
    pub fn matches(self, current: Option<u64>) -> bool {
        match (self, current) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::NoStream, None) => true,
            (ExpectedVersion::Exact(v), Some(c)) => v == c,
            _ => false,
        }
    }

    pub fn check(self, current: Option<u64>) -> DomainResult<()> {
        if self.matches(current) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {current:?})"
            )))
        }
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO, read clocks or draw random numbers. Anything
/// time-dependent travels inside the command.
pub trait Aggregate: AggregateRoot {
    /// Stable aggregate type name (e.g. `"library"`), used to derive stream ids.
    const AGGREGATE_TYPE: &'static str;

    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// A not-yet-created instance, the seed of every fold.
    fn initial(id: AggregateId) -> Self;

    /// Evolve in-memory state from a single event.
    ///
    /// Implementations must bump `version()` by exactly one per applied event.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}
