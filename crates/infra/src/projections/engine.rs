use std::sync::Mutex;

use serde_json::Value as JsonValue;
use tracing::trace;

use folio_core::StreamId;
use folio_events::{EventEnvelope, EventHandler, Projection, ProjectionApplyError, RowChange};

use super::cursor_store::{CursorCheck, ProjectionCursorStore, check_sequence};
use super::replay::Rebuildable;
use crate::read_model::DocumentStore;

/// Runs a single-entity [`Projection`] against a document store.
///
/// - Idempotent: sequence numbers at or below the (projection, stream) cursor are skipped
/// - Ordered: a sequence gap is an error and leaves the cursor untouched
/// - Events the projection does not handle still advance the cursor
#[derive(Debug)]
pub struct ProjectionEngine<P, S, C> {
    projection: P,
    store: S,
    cursors: C,
    apply_lock: Mutex<()>,
}

impl<P, S, C> ProjectionEngine<P, S, C>
where
    P: Projection,
    S: DocumentStore<P::Key, P::Row>,
    C: ProjectionCursorStore,
{
    pub fn new(projection: P, store: S, cursors: C) -> Self {
        Self {
            projection,
            store,
            cursors,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn get(&self, key: &P::Key) -> Option<P::Row> {
        self.store.get(key)
    }

    /// Every row, ordered by key.
    pub fn list(&self) -> Vec<P::Row> {
        self.store.list()
    }

    pub fn query(&self, filter: impl Fn(&P::Row) -> bool) -> Vec<P::Row> {
        self.store.query(&filter)
    }

    /// Apply one committed, current-revision event.
    pub fn apply(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionApplyError> {
        let name = self.projection.name();
        let stream = envelope.stream_id();
        let seq = envelope.sequence_number();

        let _guard = self.apply_lock.lock().unwrap_or_else(|p| p.into_inner());

        let last = self.cursors.get_cursor(name, stream);
        match check_sequence(last, seq) {
            CursorCheck::Duplicate => {
                trace!(projection = name, stream = %stream, sequence = seq, "duplicate skipped");
                return Ok(());
            }
            CursorCheck::Gap => {
                return Err(ProjectionApplyError::SequenceGap {
                    stream: stream.clone(),
                    last,
                    found: seq,
                });
            }
            CursorCheck::Next => {}
        }

        if self.projection.handles(envelope.event_type()) {
            let key = self.projection.key(envelope)?;
            let current = self.store.get(&key);
            match self.projection.apply(current.as_ref(), envelope)? {
                RowChange::Upsert(row) => self.store.upsert(key, row),
                RowChange::Delete => self.store.delete(&key),
                RowChange::Unchanged => {}
            }
        }

        // Advance cursor after successful apply.
        self.cursors.update_cursor(name, stream, seq);
        Ok(())
    }
}

impl<P, S, C> EventHandler for ProjectionEngine<P, S, C>
where
    P: Projection,
    S: DocumentStore<P::Key, P::Row>,
    C: ProjectionCursorStore,
{
    fn name(&self) -> &str {
        self.projection.name()
    }

    fn handles(&self, event_type: &str) -> bool {
        self.projection.handles(event_type)
    }

    fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionApplyError> {
        self.apply(envelope)
    }

    fn last_applied(&self, stream_id: &StreamId) -> Option<u64> {
        self.cursors.get_cursor(self.projection.name(), stream_id)
    }
}

impl<P, S, C> Rebuildable for ProjectionEngine<P, S, C>
where
    P: Projection,
    S: DocumentStore<P::Key, P::Row>,
    C: ProjectionCursorStore,
{
    fn reset(&self) {
        let _guard = self.apply_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.store.clear();
        self.cursors.clear_cursors(self.projection.name());
    }
}
