use serde_json::Value as JsonValue;

use crate::{EventEnvelope, ProjectionApplyError};

/// Outcome of applying one event to one read-model row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange<R> {
    Upsert(R),
    Delete,
    Unchanged,
}

/// A projection builds one read-model table from the event log.
///
/// Projections are the **CQRS read side**: each event is folded into at most one
/// row, addressed by `key`. The projection itself is stateless; the engine that
/// drives it owns the table, the per-stream cursors and rebuilds.
///
/// ## Idempotency
///
/// The engine skips events at or below the stream cursor, so `apply` sees each
/// `(stream, sequence)` once per table lifetime. `apply` must still be
/// deterministic: a rebuild replays the same events and must reach the same rows.
///
/// ## Disposability
///
/// Tables can be truncated and rebuilt from the log at any time.
pub trait Projection: Send + Sync + 'static {
    type Key: Clone + Ord + core::fmt::Debug + Send + Sync + 'static;
    type Row: Clone + PartialEq + core::fmt::Debug + Send + Sync + 'static;

    /// Stable projection name (cursor namespace).
    fn name(&self) -> &'static str;

    /// Whether this projection reacts to an event type.
    fn handles(&self, event_type: &str) -> bool;

    /// Row addressed by an event this projection handles.
    fn key(&self, envelope: &EventEnvelope<JsonValue>) -> Result<Self::Key, ProjectionApplyError>;

    /// Fold one event into the current row.
    fn apply(
        &self,
        current: Option<&Self::Row>,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<RowChange<Self::Row>, ProjectionApplyError>;
}
