use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use folio_core::AggregateId;
use folio_events::{EventEnvelope, Projection, ProjectionApplyError, RowChange, decode_payload};
use folio_publishing::PublisherEvent;

/// Queryable publisher read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherRow {
    pub publisher_id: AggregateId,
    pub name: String,
}

/// Publisher directory: one row per registered publisher.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublisherDirectoryProjection;

impl PublisherDirectoryProjection {
    pub const NAME: &'static str = "publisher_directory";
}

impl Projection for PublisherDirectoryProjection {
    type Key = AggregateId;
    type Row = PublisherRow;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handles(&self, event_type: &str) -> bool {
        matches!(event_type, PublisherEvent::REGISTERED | PublisherEvent::RENAMED)
    }

    fn key(&self, envelope: &EventEnvelope<JsonValue>) -> Result<AggregateId, ProjectionApplyError> {
        Ok(envelope.aggregate_id().clone())
    }

    fn apply(
        &self,
        _current: Option<&PublisherRow>,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<RowChange<PublisherRow>, ProjectionApplyError> {
        let event: PublisherEvent = decode_payload(envelope.event_type(), envelope.payload())?;
        Ok(RowChange::Upsert(PublisherRow {
            publisher_id: event.publisher_id().clone(),
            name: event.name().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::UncommittedEvent;
    use crate::projections::{InMemoryCursorStore, ProjectionEngine};
    use crate::read_model::InMemoryDocumentStore;
    use chrono::Utc;
    use folio_core::StreamId;
    use folio_events::EventMetadata;
    use folio_publishing::{PublisherRegistered, PublisherRenamed};

    fn id(s: &str) -> AggregateId {
        AggregateId::new(s).unwrap()
    }

    fn envelope(seq: u64, event: PublisherEvent) -> EventEnvelope<JsonValue> {
        let u = UncommittedEvent::from_typed("publisher", id("pub1"), &event).unwrap();
        EventEnvelope::new(
            EventMetadata {
                event_id: u.event_id,
                stream_id: StreamId::for_aggregate("publisher", &id("pub1")),
                aggregate_type: u.aggregate_type,
                aggregate_id: u.aggregate_id,
                sequence_number: seq,
                global_position: seq,
                event_type: u.event_type,
                schema_revision: u.schema_revision,
                timestamp: u.occurred_at,
            },
            u.payload,
        )
    }

    #[test]
    fn rename_replaces_the_name() {
        let directory = ProjectionEngine::new(
            PublisherDirectoryProjection,
            InMemoryDocumentStore::new(),
            InMemoryCursorStore::new(),
        );

        directory
            .apply(&envelope(
                0,
                PublisherEvent::PublisherRegistered(PublisherRegistered {
                    publisher_id: id("pub1"),
                    name: "Addison-Wesley".to_string(),
                    occurred_at: Utc::now(),
                }),
            ))
            .unwrap();
        directory
            .apply(&envelope(
                1,
                PublisherEvent::PublisherRenamed(PublisherRenamed {
                    publisher_id: id("pub1"),
                    name: "Pearson".to_string(),
                    occurred_at: Utc::now(),
                }),
            ))
            .unwrap();

        assert_eq!(directory.get(&id("pub1")).unwrap().name, "Pearson");
    }
}
