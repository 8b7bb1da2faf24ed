//! Aggregate state snapshots.
//!
//! Snapshots are advisory: deleting every one of them changes replay cost,
//! never the state an aggregate loads to.

pub mod in_memory;
pub mod writer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use folio_core::StreamId;

pub use in_memory::InMemorySnapshotStore;
pub use writer::SnapshotWriter;

/// Captured aggregate state.
///
/// `sequence_number` is the number of events folded into `state`, i.e. the
/// sequence number a tail replay resumes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_id: StreamId,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub state: JsonValue,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("failed to serialize {aggregate_type} state: {reason}")]
    Serialize {
        aggregate_type: String,
        reason: String,
    },

    #[error("snapshot backend failure: {0}")]
    Backend(String),
}

pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError>;

    /// Latest snapshot of a stream with `sequence_number <= bound`.
    fn latest_before(&self, stream_id: &StreamId, bound: u64) -> Result<Option<Snapshot>, SnapshotError>;

    fn delete_stream(&self, stream_id: &StreamId) -> Result<(), SnapshotError>;
}

impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        (**self).save(snapshot)
    }

    fn latest_before(&self, stream_id: &StreamId, bound: u64) -> Result<Option<Snapshot>, SnapshotError> {
        (**self).latest_before(stream_id, bound)
    }

    fn delete_stream(&self, stream_id: &StreamId) -> Result<(), SnapshotError> {
        (**self).delete_stream(stream_id)
    }
}

/// "Every N events" capture policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SnapshotPolicy {
    every: u64,
}

impl SnapshotPolicy {
    pub fn every(every: u64) -> Self {
        Self { every }
    }

    pub fn disabled() -> Self {
        Self { every: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.every > 0
    }

    /// Whether an append taking a stream from `before` to `after` folded
    /// events crossed a multiple of N.
    pub fn should_capture(&self, before: u64, after: u64) -> bool {
        self.is_enabled() && after > before && before / self.every != after / self.every
    }
}

impl Snapshot {
    /// Capture serializable aggregate state that has folded `sequence_number` events.
    pub fn capture<A: Serialize>(
        stream_id: StreamId,
        aggregate_type: &str,
        sequence_number: u64,
        state: &A,
    ) -> Result<Self, SnapshotError> {
        let state = serde_json::to_value(state).map_err(|e| SnapshotError::Serialize {
            aggregate_type: aggregate_type.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            stream_id,
            aggregate_type: aggregate_type.to_string(),
            sequence_number,
            state,
            taken_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_fires_when_a_multiple_is_crossed() {
        let policy = SnapshotPolicy::every(50);
        assert!(!policy.should_capture(0, 49));
        assert!(policy.should_capture(49, 50));
        assert!(policy.should_capture(48, 52));
        assert!(!policy.should_capture(50, 51));
        assert!(policy.should_capture(99, 100));
    }

    #[test]
    fn disabled_policy_never_fires() {
        assert!(!SnapshotPolicy::disabled().should_capture(49, 50));
    }
}
