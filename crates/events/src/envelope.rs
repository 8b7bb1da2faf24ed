use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_core::{AggregateId, EventId, StreamId};

/// Stream and schema metadata that travels with every committed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: EventId,
    pub stream_id: StreamId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,

    /// Position in the aggregate stream, starting at 0 with no gaps.
    pub sequence_number: u64,
    /// Position in the whole log (append order across all streams).
    pub global_position: u64,

    pub event_type: String,
    pub schema_revision: u32,
    pub timestamp: DateTime<Utc>,
}

/// Envelope for a committed event: metadata + payload.
///
/// This is the unit handed to the bus and to every handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    meta: EventMetadata,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(meta: EventMetadata, payload: E) -> Self {
        Self { meta, payload }
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.meta
    }

    pub fn event_id(&self) -> EventId {
        self.meta.event_id
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.meta.stream_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.meta.aggregate_type
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.meta.aggregate_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.meta.sequence_number
    }

    pub fn global_position(&self) -> u64 {
        self.meta.global_position
    }

    pub fn event_type(&self) -> &str {
        &self.meta.event_type
    }

    pub fn schema_revision(&self) -> u32 {
        self.meta.schema_revision
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.meta.timestamp
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    pub fn into_parts(self) -> (EventMetadata, E) {
        (self.meta, self.payload)
    }
}
