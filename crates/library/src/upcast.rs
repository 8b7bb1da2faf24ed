//! Historical revisions of `library.book_added`.
//!
//! - rev 1 stored the book title under `name` and had no publisher attribution.
//! - rev 2 renamed `name` to `title` and introduced `publisher_id`.
//! - rev 3 (current) records the `transfer_id` of books arriving through a
//!   transfer, and stores the isbn in key form (no hyphens or whitespace,
//!   uppercase check digit).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_core::AggregateId;
use folio_events::Upcasters;

use crate::library::{LibraryEvent, canonical_isbn};

pub const BOOK_ADDED_REVISION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookAddedV1 {
    pub library_id: AggregateId,
    pub isbn: String,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookAddedV2 {
    pub library_id: AggregateId,
    pub isbn: String,
    pub title: String,
    pub publisher_id: Option<AggregateId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookAddedV3 {
    pub library_id: AggregateId,
    pub isbn: String,
    pub title: String,
    pub publisher_id: Option<AggregateId>,
    pub transfer_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

pub fn book_added_v1_to_v2(v: BookAddedV1) -> BookAddedV2 {
    BookAddedV2 {
        library_id: v.library_id,
        isbn: v.isbn,
        title: v.name,
        publisher_id: None,
        occurred_at: v.occurred_at,
    }
}

pub fn book_added_v2_to_v3(v: BookAddedV2) -> BookAddedV3 {
    BookAddedV3 {
        library_id: v.library_id,
        isbn: canonical_isbn(&v.isbn),
        title: v.title,
        publisher_id: v.publisher_id,
        transfer_id: None,
        occurred_at: v.occurred_at,
    }
}

/// Declare current revisions for every library event and register the
/// `book_added` chain.
pub fn register_upcasters(upcasters: &mut Upcasters) {
    upcasters
        .declare_current(LibraryEvent::CREATED, 1)
        .declare_current(LibraryEvent::RENAMED, 1)
        .declare_current(LibraryEvent::BOOK_REMOVED, 1)
        .declare_current(LibraryEvent::BOOK_TRANSFERRED_OUT, 1)
        .declare_current(LibraryEvent::BOOK_ADDED, BOOK_ADDED_REVISION)
        .register(LibraryEvent::BOOK_ADDED, 1, book_added_v1_to_v2)
        .register(LibraryEvent::BOOK_ADDED, 2, book_added_v2_to_v3);
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_events::decode_payload;
    use serde_json::json;

    #[test]
    fn revision_one_payload_decodes_as_current_event() {
        let mut upcasters = Upcasters::new();
        register_upcasters(&mut upcasters);

        let (rev, payload) = upcasters
            .upcast(
                LibraryEvent::BOOK_ADDED,
                1,
                json!({
                    "library_id": "lib1",
                    "isbn": " 978-0134685991",
                    "name": "Effective Java",
                    "occurred_at": "2019-03-01T09:00:00Z"
                }),
            )
            .unwrap();
        assert_eq!(rev, BOOK_ADDED_REVISION);

        let event: LibraryEvent = decode_payload(LibraryEvent::BOOK_ADDED, &payload).unwrap();
        match event {
            LibraryEvent::BookAdded(e) => {
                assert_eq!(e.title, "Effective Java");
                assert_eq!(e.isbn.as_str(), "9780134685991");
                assert_eq!(e.publisher_id, None);
                assert_eq!(e.transfer_id, None);
            }
            other => panic!("expected BookAdded, got {other:?}"),
        }
    }

    #[test]
    fn revision_two_keeps_publisher_attribution() {
        let mut upcasters = Upcasters::new();
        register_upcasters(&mut upcasters);

        let (_, payload) = upcasters
            .upcast(
                LibraryEvent::BOOK_ADDED,
                2,
                json!({
                    "library_id": "lib1",
                    "isbn": "0-306-40615-x",
                    "title": "Effective Java",
                    "publisher_id": "pub1",
                    "occurred_at": "2021-03-01T09:00:00Z"
                }),
            )
            .unwrap();
        assert_eq!(payload["publisher_id"], "pub1");
        assert_eq!(payload["isbn"], "030640615X");
        assert!(payload["transfer_id"].is_null());
    }
}
