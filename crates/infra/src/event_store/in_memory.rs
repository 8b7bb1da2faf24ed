use std::collections::HashMap;
use std::sync::RwLock;

use folio_core::{ExpectedVersion, StreamId};

use super::r#trait::{EventLog, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Default)]
struct Inner {
    /// Every event in global append order; the index is the global position.
    all: Vec<StoredEvent>,
    /// Per-stream indices into `all`, in sequence order.
    streams: HashMap<StreamId, Vec<usize>>,
}

/// In-memory append-only event log.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    inner: RwLock<Inner>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events in the log.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.all.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> EventStoreError {
        EventStoreError::Backend("lock poisoned".to_string())
    }
}

impl EventLog for InMemoryEventLog {
    fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Err(EventStoreError::InvalidAppend("empty batch".to_string()));
        }

        // All events must target the stream being appended to.
        let aggregate_type = events[0].aggregate_type.clone();
        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
            if &e.stream_id() != stream_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "event at index {idx} belongs to {}, not {stream_id}",
                    e.stream_id()
                )));
            }
        }

        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let Inner { all, streams } = &mut *inner;

        let indices = streams.get(stream_id);
        let current = indices
            .and_then(|idx| idx.last())
            .map(|&i| all[i].sequence_number);

        if !expected.matches(current) {
            return Err(EventStoreError::Concurrency {
                stream: stream_id.clone(),
                expected,
                actual: current,
            });
        }

        // Enforce aggregate type stability across the stream.
        if let Some(&first) = indices.and_then(|idx| idx.first()) {
            if all[first].aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    all[first].aggregate_type, aggregate_type
                )));
            }
        }

        // Everything validated; from here on the batch lands as a whole.
        let mut next = current.map(|c| c + 1).unwrap_or(0);
        let mut committed = Vec::with_capacity(events.len());
        let stream = streams.entry(stream_id.clone()).or_default();
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                stream_id: stream_id.clone(),
                aggregate_type: e.aggregate_type,
                aggregate_id: e.aggregate_id,
                sequence_number: next,
                global_position: all.len() as u64,
                event_type: e.event_type,
                schema_revision: e.schema_revision,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(all.len());
            all.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn read_page(
        &self,
        stream_id: &StreamId,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let Some(indices) = inner.streams.get(stream_id) else {
            return Ok(vec![]);
        };

        // Sequence numbers are dense from 0, so they double as offsets.
        Ok(indices
            .iter()
            .skip(usize::try_from(from_sequence).unwrap_or(usize::MAX))
            .take(limit)
            .map(|&i| inner.all[i].clone())
            .collect())
    }

    fn read_all_page(
        &self,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner
            .all
            .iter()
            .skip(usize::try_from(from_position).unwrap_or(usize::MAX))
            .take(limit)
            .cloned()
            .collect())
    }

    fn stream_version(&self, stream_id: &StreamId) -> Result<Option<u64>, EventStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner
            .streams
            .get(stream_id)
            .and_then(|idx| idx.last())
            .map(|&i| inner.all[i].sequence_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use folio_core::{AggregateId, EventId};
    use serde_json::json;

    fn event(aggregate_type: &str, id: &str, n: u64) -> UncommittedEvent {
        UncommittedEvent {
            event_id: EventId::new(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: AggregateId::new(id).unwrap(),
            event_type: "test.happened".to_string(),
            schema_revision: 1,
            occurred_at: Utc::now(),
            payload: json!({ "n": n }),
        }
    }

    fn stream(aggregate_type: &str, id: &str) -> StreamId {
        StreamId::for_aggregate(aggregate_type, &AggregateId::new(id).unwrap())
    }

    #[test]
    fn sequences_start_at_zero_and_are_contiguous() {
        let log = InMemoryEventLog::new();
        let s = stream("library", "lib1");

        let first = log
            .append(&s, ExpectedVersion::NoStream, vec![event("library", "lib1", 0)])
            .unwrap();
        assert_eq!(first[0].sequence_number, 0);

        let next = log
            .append(
                &s,
                ExpectedVersion::Exact(0),
                vec![event("library", "lib1", 1), event("library", "lib1", 2)],
            )
            .unwrap();
        let seqs: Vec<_> = next.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(log.stream_version(&s).unwrap(), Some(2));
    }

    #[test]
    fn stale_expectation_is_a_concurrency_error_and_appends_nothing() {
        let log = InMemoryEventLog::new();
        let s = stream("library", "lib1");
        log.append(&s, ExpectedVersion::NoStream, vec![event("library", "lib1", 0)])
            .unwrap();

        let err = log
            .append(&s, ExpectedVersion::NoStream, vec![event("library", "lib1", 1)])
            .unwrap_err();
        assert_eq!(
            err,
            EventStoreError::Concurrency {
                stream: s.clone(),
                expected: ExpectedVersion::NoStream,
                actual: Some(0),
            }
        );
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn global_positions_interleave_streams() {
        let log = InMemoryEventLog::new();
        let a = stream("library", "a");
        let b = stream("library", "b");
        log.append(&a, ExpectedVersion::Any, vec![event("library", "a", 0)]).unwrap();
        log.append(&b, ExpectedVersion::Any, vec![event("library", "b", 0)]).unwrap();
        log.append(&a, ExpectedVersion::Any, vec![event("library", "a", 1)]).unwrap();

        let positions: Vec<_> = log
            .read_all(0, 2)
            .map(|e| {
                let e = e.unwrap();
                (e.stream_id.to_string(), e.sequence_number, e.global_position)
            })
            .collect();
        assert_eq!(
            positions,
            vec![
                ("library-a".to_string(), 0, 0),
                ("library-b".to_string(), 0, 1),
                ("library-a".to_string(), 1, 2),
            ]
        );
    }

    #[test]
    fn reads_are_paged_and_restartable() {
        let log = InMemoryEventLog::new();
        let s = stream("library", "lib1");
        let batch = (0..7).map(|n| event("library", "lib1", n)).collect();
        log.append(&s, ExpectedVersion::NoStream, batch).unwrap();

        let mut reader = log.read(&s, 0, 3);
        let head: Vec<_> = reader.by_ref().take(4).map(|e| e.unwrap().sequence_number).collect();
        assert_eq!(head, vec![0, 1, 2, 3]);

        let resume_at = reader.position();
        assert_eq!(resume_at, 4);
        let tail: Vec<_> = log
            .read(&s, resume_at, 3)
            .map(|e| e.unwrap().sequence_number)
            .collect();
        assert_eq!(tail, vec![4, 5, 6]);
    }

    #[test]
    fn stream_aggregate_type_is_fixed_by_first_event() {
        let log = InMemoryEventLog::new();
        let s = stream("library", "x");
        log.append(&s, ExpectedVersion::Any, vec![event("library", "x", 0)]).unwrap();

        // Same rendered stream id, different aggregate type field.
        let mut odd = event("library", "x", 1);
        odd.aggregate_type = "publisher".to_string();
        let err = log.append(&s, ExpectedVersion::Any, vec![odd]).unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::InvalidAppend(_) | EventStoreError::AggregateTypeMismatch(_)
        ));
    }

    #[test]
    fn mixed_batches_are_refused_atomically() {
        let log = InMemoryEventLog::new();
        let s = stream("library", "lib1");
        let err = log
            .append(
                &s,
                ExpectedVersion::Any,
                vec![event("library", "lib1", 0), event("library", "lib2", 0)],
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
        assert!(log.is_empty());
    }
}
