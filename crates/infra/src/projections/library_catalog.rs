use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use folio_core::AggregateId;
use folio_events::{EventEnvelope, Projection, ProjectionApplyError, RowChange, decode_payload};
use folio_library::{Isbn, LibraryEvent};

use super::cursor_store::ProjectionCursorStore;
use super::engine::ProjectionEngine;
use crate::read_model::DocumentStore;

/// A book on a library's shelf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogBook {
    pub isbn: Isbn,
    pub title: String,
    pub publisher_id: Option<AggregateId>,
}

/// Queryable library read model: name and current holdings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRow {
    pub library_id: AggregateId,
    pub name: String,
    /// Ordered by isbn.
    pub books: Vec<CatalogBook>,
}

impl LibraryRow {
    pub fn holds(&self, isbn: &Isbn) -> bool {
        self.books.binary_search_by(|b| b.isbn.cmp(isbn)).is_ok()
    }
}

/// Library catalog: one row per library.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibraryCatalogProjection;

impl LibraryCatalogProjection {
    pub const NAME: &'static str = "library_catalog";
}

impl Projection for LibraryCatalogProjection {
    type Key = AggregateId;
    type Row = LibraryRow;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handles(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            LibraryEvent::CREATED
                | LibraryEvent::RENAMED
                | LibraryEvent::BOOK_ADDED
                | LibraryEvent::BOOK_REMOVED
                | LibraryEvent::BOOK_TRANSFERRED_OUT
        )
    }

    fn key(&self, envelope: &EventEnvelope<JsonValue>) -> Result<AggregateId, ProjectionApplyError> {
        Ok(envelope.aggregate_id().clone())
    }

    fn apply(
        &self,
        current: Option<&LibraryRow>,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<RowChange<LibraryRow>, ProjectionApplyError> {
        let event: LibraryEvent = decode_payload(envelope.event_type(), envelope.payload())?;

        if let LibraryEvent::LibraryCreated(e) = &event {
            return Ok(RowChange::Upsert(LibraryRow {
                library_id: e.library_id.clone(),
                name: e.name.clone(),
                books: vec![],
            }));
        }

        // Everything else edits an existing row.
        let Some(current) = current else {
            return Ok(RowChange::Unchanged);
        };
        let mut row = current.clone();

        match event {
            LibraryEvent::LibraryCreated(_) => {}
            LibraryEvent::LibraryRenamed(e) => row.name = e.name,
            LibraryEvent::BookAdded(e) => {
                let book = CatalogBook {
                    isbn: e.isbn,
                    title: e.title,
                    publisher_id: e.publisher_id,
                };
                match row.books.binary_search_by(|b| b.isbn.cmp(&book.isbn)) {
                    Ok(idx) => row.books[idx] = book,
                    Err(idx) => row.books.insert(idx, book),
                }
            }
            LibraryEvent::BookRemoved(e) => row.books.retain(|b| b.isbn != e.isbn),
            LibraryEvent::BookTransferredOut(e) => row.books.retain(|b| b.isbn != e.isbn),
        }

        Ok(RowChange::Upsert(row))
    }
}

impl<S, C> ProjectionEngine<LibraryCatalogProjection, S, C>
where
    S: DocumentStore<AggregateId, LibraryRow>,
    C: ProjectionCursorStore,
{
    /// Libraries currently holding a copy of `isbn`, ordered by library id.
    pub fn libraries_holding(&self, isbn: &Isbn) -> Vec<LibraryRow> {
        self.query(|row| row.holds(isbn))
    }
}
