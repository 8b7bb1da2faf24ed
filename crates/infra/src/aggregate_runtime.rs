//! Aggregate rehydration: snapshot + upcast tail replay.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{error, warn};

use folio_core::{Aggregate, AggregateId, StreamId};
use folio_events::{CodecError, UpcastError, Upcasters, decode_payload};

use crate::event_store::{EventLog, EventStoreError, StoredEvent};
use crate::snapshot::{Snapshot, SnapshotStore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Upcast(#[from] UpcastError),

    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("stream {stream} is not contiguous: expected sequence {expected}, found {found}")]
    Gap {
        stream: StreamId,
        expected: u64,
        found: u64,
    },
}

/// Rehydrated aggregate state.
#[derive(Debug, Clone)]
pub struct Loaded<A> {
    pub state: A,
    /// Tail events folded on top of the snapshot (or from zero).
    pub replayed: u64,
    /// Whether a snapshot seeded the fold.
    pub from_snapshot: bool,
}

/// Loads aggregates from the log, seeded from snapshots when one is usable.
///
/// Every stored event goes through the upcaster registry before it is decoded,
/// so aggregates only ever see current-revision events.
#[derive(Debug)]
pub struct AggregateRuntime<L, S> {
    log: L,
    snapshots: S,
    upcasters: Arc<Upcasters>,
    page_size: usize,
}

impl<L, S> AggregateRuntime<L, S> {
    pub fn new(log: L, snapshots: S, upcasters: Arc<Upcasters>, page_size: usize) -> Self {
        Self {
            log,
            snapshots,
            upcasters,
            page_size: page_size.max(1),
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn snapshots(&self) -> &S {
        &self.snapshots
    }

    pub fn upcasters(&self) -> &Upcasters {
        &self.upcasters
    }
}

impl<L, S> AggregateRuntime<L, S>
where
    L: EventLog,
    S: SnapshotStore,
{
    pub fn load<A>(&self, aggregate_id: &AggregateId) -> Result<Loaded<A>, LoadError>
    where
        A: Aggregate + DeserializeOwned,
        A::Event: DeserializeOwned,
    {
        let stream = StreamId::for_aggregate(A::AGGREGATE_TYPE, aggregate_id);

        let (mut state, from_snapshot) = match self.restore::<A>(&stream) {
            Some(state) => (state, true),
            None => (A::initial(aggregate_id.clone()), false),
        };

        let mut replayed = 0;
        for stored in self.log.read(&stream, state.version(), self.page_size) {
            let stored = stored?;
            let expected = state.version();
            if stored.sequence_number != expected {
                return Err(LoadError::Gap {
                    stream,
                    expected,
                    found: stored.sequence_number,
                });
            }
            let event: A::Event = self.decode(&stored)?;
            state.apply(&event);
            replayed += 1;
        }

        Ok(Loaded {
            state,
            replayed,
            from_snapshot,
        })
    }

    /// Upcast and decode one stored event.
    pub fn decode<E: DeserializeOwned>(&self, stored: &StoredEvent) -> Result<E, LoadError> {
        let (_, payload) = self
            .upcasters
            .upcast(&stored.event_type, stored.schema_revision, stored.payload.clone())
            .inspect_err(|err| {
                error!(
                    stream = %stored.stream_id,
                    sequence = stored.sequence_number,
                    error = %err,
                    "upcast failed"
                );
            })?;
        Ok(decode_payload(&stored.event_type, &payload)?)
    }

    fn restore<A>(&self, stream: &StreamId) -> Option<A>
    where
        A: Aggregate + DeserializeOwned,
    {
        let snapshot = match self.snapshots.latest_before(stream, u64::MAX) {
            Ok(Some(s)) => s,
            Ok(None) => return None,
            Err(err) => {
                warn!(stream = %stream, error = %err, "snapshot lookup failed; replaying from zero");
                return None;
            }
        };

        let state: A = match serde_json::from_value(snapshot.state) {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    stream = %stream,
                    sequence = snapshot.sequence_number,
                    error = %err,
                    "snapshot does not deserialize; ignoring it"
                );
                return None;
            }
        };

        if state.version() != snapshot.sequence_number {
            warn!(
                stream = %stream,
                sequence = snapshot.sequence_number,
                version = state.version(),
                "snapshot sequence does not match restored state; ignoring it"
            );
            return None;
        }

        Some(state)
    }
}

/// Snapshot of an aggregate's current state.
pub fn capture<A>(state: &A) -> Result<Snapshot, crate::snapshot::SnapshotError>
where
    A: Aggregate<Id = AggregateId> + Serialize,
{
    Snapshot::capture(
        StreamId::for_aggregate(A::AGGREGATE_TYPE, state.id()),
        A::AGGREGATE_TYPE,
        state.version(),
        state,
    )
}
