use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use folio_core::{AggregateId, EventId, ExpectedVersion, StreamId};
use folio_events::{CodecError, EventEnvelope, EventMetadata, encode_payload};

/// An event ready to be appended to a stream (not yet assigned a position).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: decided by an aggregate's `handle()`
/// 2. **UncommittedEvent**: payload encoded, stream identity attached
/// 3. **StoredEvent**: persisted with its sequence number and global position
/// 4. **EventEnvelope**: handed to the bus and to read-side handlers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: EventId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,

    pub event_type: String,
    pub schema_revision: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Encode a typed domain event for the stream of `aggregate_type`/`aggregate_id`.
    pub fn from_typed<E>(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        event: &E,
    ) -> Result<Self, CodecError>
    where
        E: folio_events::Event + Serialize,
    {
        Ok(Self {
            event_id: EventId::new(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event.event_type().to_string(),
            schema_revision: event.schema_revision(),
            occurred_at: event.occurred_at(),
            payload: encode_payload(event)?,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        StreamId::for_aggregate(&self.aggregate_type, &self.aggregate_id)
    }
}

/// A persisted event.
///
/// ## Positions
///
/// - `sequence_number` is stream-scoped, starts at 0 and has no gaps
/// - `global_position` is the 0-based append order across the whole log; it
///   drives catch-up and breaks ties between streams
///
/// Both are assigned by the log during append and never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub stream_id: StreamId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,

    pub sequence_number: u64,
    pub global_position: u64,

    pub event_type: String,
    pub schema_revision: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Envelope for publication and read-side delivery.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            EventMetadata {
                event_id: self.event_id,
                stream_id: self.stream_id.clone(),
                aggregate_type: self.aggregate_type.clone(),
                aggregate_id: self.aggregate_id.clone(),
                sequence_number: self.sequence_number,
                global_position: self.global_position,
                event_type: self.event_type.clone(),
                schema_revision: self.schema_revision,
                timestamp: self.occurred_at,
            },
            self.payload.clone(),
        )
    }

    pub fn into_envelope(self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            EventMetadata {
                event_id: self.event_id,
                stream_id: self.stream_id,
                aggregate_type: self.aggregate_type,
                aggregate_id: self.aggregate_id,
                sequence_number: self.sequence_number,
                global_position: self.global_position,
                event_type: self.event_type,
                schema_revision: self.schema_revision,
                timestamp: self.occurred_at,
            },
            self.payload,
        )
    }
}

/// Event log operation error.
///
/// These are **infrastructure errors** (concurrency, stream integrity, backend
/// failures) as opposed to domain errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed on {stream}: expected {expected:?}, actual {actual:?}")]
    Concurrency {
        stream: StreamId,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event log backend failure: {0}")]
    Backend(String),
}

/// Append-only event log, the single source of truth.
///
/// ## Streams
///
/// Events are organized into streams, one per aggregate instance
/// (`<aggregate_type>-<aggregate_id>`). A stream's aggregate type is fixed by
/// its first event.
///
/// ## Append Semantics
///
/// `append()`:
/// - checks `expected` against the stream's highest sequence number
/// - assigns contiguous sequence numbers (from `highest + 1`, or 0) and
///   global positions
/// - persists the whole batch or nothing
///
/// ## Read Semantics
///
/// Reads are paged. [`EventLog::read`] and [`EventLog::read_all`] wrap the page
/// primitives into lazy iterators that can be restarted from
/// [`PagedRead::position`].
pub trait EventLog: Send + Sync {
    /// Append a batch to one stream and return the committed events.
    ///
    /// The new stream version is the last committed sequence number.
    fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Up to `limit` events of a stream with `sequence_number >= from_sequence`.
    fn read_page(
        &self,
        stream_id: &StreamId,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Up to `limit` events of the whole log with `global_position >= from_position`.
    fn read_all_page(
        &self,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Highest sequence number of a stream, `None` when it is empty.
    fn stream_version(&self, stream_id: &StreamId) -> Result<Option<u64>, EventStoreError>;

    /// Lazily read a stream from `from_sequence` on.
    fn read(&self, stream_id: &StreamId, from_sequence: u64, page_size: usize) -> PagedRead<'_, Self>
    where
        Self: Sized,
    {
        PagedRead::new(self, ReadScope::Stream(stream_id.clone()), from_sequence, page_size)
    }

    /// Lazily scan the whole log from `from_position` on.
    fn read_all(&self, from_position: u64, page_size: usize) -> PagedRead<'_, Self>
    where
        Self: Sized,
    {
        PagedRead::new(self, ReadScope::All, from_position, page_size)
    }
}

impl<L> EventLog for Arc<L>
where
    L: EventLog + ?Sized,
{
    fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(stream_id, expected, events)
    }

    fn read_page(
        &self,
        stream_id: &StreamId,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).read_page(stream_id, from_sequence, limit)
    }

    fn read_all_page(
        &self,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).read_all_page(from_position, limit)
    }

    fn stream_version(&self, stream_id: &StreamId) -> Result<Option<u64>, EventStoreError> {
        (**self).stream_version(stream_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScope {
    Stream(StreamId),
    All,
}

/// Lazy, page-at-a-time iterator over a stream or the whole log.
///
/// A failed page fetch yields one `Err` and ends the iteration; resume with a
/// fresh read from [`position`](Self::position).
pub struct PagedRead<'a, L: ?Sized> {
    log: &'a L,
    scope: ReadScope,
    next: u64,
    page_size: usize,
    buffer: VecDeque<StoredEvent>,
    exhausted: bool,
}

impl<'a, L: EventLog + ?Sized> PagedRead<'a, L> {
    pub fn new(log: &'a L, scope: ReadScope, from: u64, page_size: usize) -> Self {
        Self {
            log,
            scope,
            next: from,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Sequence number (or global position) the next yielded event will have at least.
    pub fn position(&self) -> u64 {
        self.buffer.front().map(|e| self.cursor_of(e)).unwrap_or(self.next)
    }

    fn cursor_of(&self, event: &StoredEvent) -> u64 {
        match self.scope {
            ReadScope::Stream(_) => event.sequence_number,
            ReadScope::All => event.global_position,
        }
    }

    fn fetch(&mut self) -> Result<(), EventStoreError> {
        let page = match &self.scope {
            ReadScope::Stream(stream_id) => self.log.read_page(stream_id, self.next, self.page_size)?,
            ReadScope::All => self.log.read_all_page(self.next, self.page_size)?,
        };

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.next = self.cursor_of(last) + 1;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<L: EventLog + ?Sized> Iterator for PagedRead<'_, L> {
    type Item = Result<StoredEvent, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fetch() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
