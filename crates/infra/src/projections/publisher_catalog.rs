//! Publisher catalog: a materialized join of publishers and the books
//! attributed to them across every library.
//!
//! The document of a publisher is touched only for the entry an event affects.
//! Entries remember the stamp `(timestamp, global_position)` of the event that
//! last won for them; removed books stay as tombstones so a late, older event
//! can neither resurrect nor remove them. Out-of-order delivery across streams
//! therefore converges to the same document.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::trace;

use folio_core::{AggregateId, StreamId};
use folio_events::{EventEnvelope, EventHandler, ProjectionApplyError, decode_payload};
use folio_library::{Isbn, LibraryEvent};
use folio_publishing::PublisherEvent;

use super::replay::Rebuildable;
use crate::read_model::DocumentStore;

/// Ordering key of an event for conflict resolution: later timestamp wins,
/// then later global position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub timestamp: DateTime<Utc>,
    pub global_position: u64,
}

impl Stamp {
    pub fn of(envelope: &EventEnvelope<JsonValue>) -> Self {
        Self {
            timestamp: envelope.timestamp(),
            global_position: envelope.global_position(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookEntry {
    pub title: String,
    pub present: bool,
    pub stamp: Stamp,
}

/// Stored join document, tombstones included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherDocument {
    pub publisher_id: AggregateId,
    /// `None` until the publisher's registration has been processed.
    pub name: Option<String>,
    pub name_stamp: Option<Stamp>,
    pub entries: BTreeMap<Isbn, BookEntry>,
}

impl PublisherDocument {
    fn partial(publisher_id: AggregateId) -> Self {
        Self {
            publisher_id,
            name: None,
            name_stamp: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn view(&self) -> PublisherCatalog {
        PublisherCatalog {
            publisher_id: self.publisher_id.clone(),
            name: self.name.clone(),
            books: self
                .entries
                .iter()
                .filter(|(_, e)| e.present)
                .map(|(isbn, e)| PublishedBook {
                    isbn: isbn.clone(),
                    title: e.title.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedBook {
    pub isbn: Isbn,
    pub title: String,
}

/// Query view of a publisher and its current books (ordered by isbn).
///
/// A book's presence is tracked per (publisher, isbn), not per library: the
/// latest add or remove by timestamp, then global position, wins across every
/// library. A library removing its copy therefore hides the book here even
/// while another library still holds one; ask the library catalog which
/// libraries hold an isbn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherCatalog {
    pub publisher_id: AggregateId,
    pub name: Option<String>,
    pub books: Vec<PublishedBook>,
}

/// Incrementally maintained publisher ⨝ books view.
#[derive(Debug)]
pub struct PublisherCatalogJoin<S> {
    store: S,
    applied: RwLock<HashMap<StreamId, u64>>,
    apply_lock: Mutex<()>,
}

impl<S> PublisherCatalogJoin<S>
where
    S: DocumentStore<AggregateId, PublisherDocument>,
{
    pub const NAME: &'static str = "publisher_catalog";

    pub fn new(store: S) -> Self {
        Self {
            store,
            applied: RwLock::new(HashMap::new()),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, publisher_id: &AggregateId) -> Option<PublisherCatalog> {
        self.store.get(publisher_id).map(|d| d.view())
    }

    /// Every publisher document, ordered by publisher id.
    pub fn list(&self) -> Vec<PublisherCatalog> {
        self.store.list().iter().map(PublisherDocument::view).collect()
    }

    /// Raw document including tombstones.
    pub fn document(&self, publisher_id: &AggregateId) -> Option<PublisherDocument> {
        self.store.get(publisher_id)
    }

    pub fn apply(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionApplyError> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|p| p.into_inner());
        let stamp = Stamp::of(envelope);

        match envelope.event_type() {
            PublisherEvent::REGISTERED | PublisherEvent::RENAMED => {
                let event: PublisherEvent = decode_payload(envelope.event_type(), envelope.payload())?;
                self.set_name(event.publisher_id(), event.name(), stamp);
            }
            LibraryEvent::BOOK_ADDED | LibraryEvent::BOOK_REMOVED | LibraryEvent::BOOK_TRANSFERRED_OUT => {
                let event: LibraryEvent = decode_payload(envelope.event_type(), envelope.payload())?;
                match event {
                    LibraryEvent::BookAdded(e) => {
                        if let Some(pid) = e.publisher_id {
                            self.set_entry(pid, e.isbn, Some(e.title), true, stamp);
                        }
                    }
                    LibraryEvent::BookRemoved(e) => {
                        if let Some(pid) = e.publisher_id {
                            self.set_entry(pid, e.isbn, None, false, stamp);
                        }
                    }
                    LibraryEvent::BookTransferredOut(e) => {
                        if let Some(pid) = e.publisher_id {
                            self.set_entry(pid, e.isbn, Some(e.title), false, stamp);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        if let Ok(mut applied) = self.applied.write() {
            let seq = envelope.sequence_number();
            applied
                .entry(envelope.stream_id().clone())
                .and_modify(|last| *last = (*last).max(seq))
                .or_insert(seq);
        }
        Ok(())
    }

    fn set_name(&self, publisher_id: &AggregateId, name: &str, stamp: Stamp) {
        let mut doc = self
            .store
            .get(publisher_id)
            .unwrap_or_else(|| PublisherDocument::partial(publisher_id.clone()));
        if doc.name_stamp.is_some_and(|s| s >= stamp) {
            trace!(publisher = %publisher_id, "stale publisher name ignored");
            return;
        }
        doc.name = Some(name.to_string());
        doc.name_stamp = Some(stamp);
        self.store.upsert(publisher_id.clone(), doc);
    }

    fn set_entry(
        &self,
        publisher_id: AggregateId,
        isbn: Isbn,
        title: Option<String>,
        present: bool,
        stamp: Stamp,
    ) {
        let mut doc = self
            .store
            .get(&publisher_id)
            .unwrap_or_else(|| PublisherDocument::partial(publisher_id.clone()));

        let previous = doc.entries.get(&isbn);
        if previous.is_some_and(|e| e.stamp >= stamp) {
            trace!(publisher = %publisher_id, isbn = %isbn, "stale book event ignored");
            return;
        }
        let title = title
            .or_else(|| previous.map(|e| e.title.clone()))
            .unwrap_or_default();

        doc.entries.insert(
            isbn,
            BookEntry {
                title,
                present,
                stamp,
            },
        );
        self.store.upsert(publisher_id, doc);
    }
}

impl<S> EventHandler for PublisherCatalogJoin<S>
where
    S: DocumentStore<AggregateId, PublisherDocument>,
{
    fn name(&self) -> &str {
        Self::NAME
    }

    fn handles(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            PublisherEvent::REGISTERED
                | PublisherEvent::RENAMED
                | LibraryEvent::BOOK_ADDED
                | LibraryEvent::BOOK_REMOVED
                | LibraryEvent::BOOK_TRANSFERRED_OUT
        )
    }

    fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionApplyError> {
        self.apply(envelope)
    }

    fn last_applied(&self, stream_id: &StreamId) -> Option<u64> {
        self.applied.read().ok()?.get(stream_id).copied()
    }
}

impl<S> Rebuildable for PublisherCatalogJoin<S>
where
    S: DocumentStore<AggregateId, PublisherDocument>,
{
    fn reset(&self) {
        let _guard = self.apply_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.store.clear();
        if let Ok(mut applied) = self.applied.write() {
            applied.clear();
        }
    }
}
