use serde_json::Value as JsonValue;
use thiserror::Error;

use folio_core::StreamId;

use crate::EventEnvelope;
use crate::upcast::UpcastError;

/// Failure of a read-side handler to apply one event.
///
/// These never reach command callers: the delivery pipeline retries them with
/// backoff and, if they persist, parks the offending stream for that handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionApplyError {
    #[error("failed to decode {event_type}: {reason}")]
    Decode { event_type: String, reason: String },

    #[error(transparent)]
    Upcast(#[from] UpcastError),

    #[error("sequence gap on {stream}: last applied {last:?}, found {found}")]
    SequenceGap {
        stream: StreamId,
        last: Option<u64>,
        found: u64,
    },

    #[error("read model store failure: {0}")]
    Store(String),
}

impl From<crate::event::CodecError> for ProjectionApplyError {
    fn from(value: crate::event::CodecError) -> Self {
        match value {
            crate::event::CodecError::Encode { event_type, reason }
            | crate::event::CodecError::Decode { event_type, reason } => {
                ProjectionApplyError::Decode { event_type, reason }
            }
        }
    }
}

/// A read-side consumer of committed events.
///
/// Handlers are registered explicitly at startup (a plain list of trait objects),
/// and every one of them must be idempotent: the bus delivers at least once and
/// catch-up replays from the handler's own cursor.
pub trait EventHandler: Send + Sync {
    /// Stable handler name; also the key of its cursors.
    fn name(&self) -> &str;

    /// Whether events of this type change the handler's state.
    ///
    /// Handlers still receive every event so their per-stream cursors stay
    /// contiguous; unhandled events only advance the cursor.
    fn handles(&self, event_type: &str) -> bool;

    /// Apply one committed, already upcast event.
    fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionApplyError>;

    /// Highest sequence number applied for a stream, if any.
    fn last_applied(&self, stream_id: &StreamId) -> Option<u64>;
}

/// Execute an aggregate command in place (no IO, no persistence).
///
/// Decide with `handle`, then evolve with `apply` for each decided event. This is
/// the pure lifecycle the dispatcher runs around persistence; tests use it to
/// compare live state against replayed state.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: folio_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
