//! Integration tests for the full event-sourced pipeline.
//!
//! Tests: Command → EventLog → EventBus/catch-up → Projections, join, saga → ReadModel
//!
//! Verifies:
//! - Commands produce events that update read models correctly
//! - Rebuilding from the log equals incremental maintenance
//! - Transfers complete, or time out and compensate
//! - A failing handler degrades one stream without stopping the others

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use serde_json::{Value as JsonValue, json};

    use folio_core::{AggregateId, EventId, ExpectedVersion, StreamId};
    use folio_events::{EventEnvelope, EventHandler, ProjectionApplyError};
    use folio_library::{
        AddBook, CreateLibrary, Isbn, Library, LibraryCommand, LibraryEvent, RemoveBook, TransferBook,
        rejection,
    };
    use folio_publishing::{PublisherCommand, RegisterPublisher};

    use crate::command_dispatcher::DispatchError;
    use crate::config::EngineConfig;
    use crate::engine::InMemoryEngine;
    use crate::event_store::{EventLog, UncommittedEvent};
    use crate::projections::LibraryRow;
    use crate::saga::TransferPhase;
    use crate::workers::DeliveryPipeline;

    fn id(s: &str) -> AggregateId {
        AggregateId::new(s).unwrap()
    }

    fn isbn(s: &str) -> Isbn {
        Isbn::parse(s).unwrap()
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
    }

    fn engine() -> InMemoryEngine {
        InMemoryEngine::new(
            EngineConfig::default()
                .with_projection_retry(2, Duration::from_millis(1))
                .with_saga_timeout(Duration::from_secs(600)),
        )
    }

    fn create_library(lib: &str, name: &str) -> LibraryCommand {
        LibraryCommand::CreateLibrary(CreateLibrary {
            library_id: id(lib),
            name: name.to_string(),
            occurred_at: at(0),
        })
    }

    fn add_book(lib: &str, code: &str, publisher: Option<&str>, minute: u32) -> LibraryCommand {
        LibraryCommand::AddBook(AddBook {
            library_id: id(lib),
            isbn: code.to_string(),
            title: format!("Title {code}"),
            publisher_id: publisher.map(id),
            transfer_id: None,
            occurred_at: at(minute),
        })
    }

    fn register_publisher(publisher: &str, name: &str) -> PublisherCommand {
        PublisherCommand::RegisterPublisher(RegisterPublisher {
            publisher_id: id(publisher),
            name: name.to_string(),
            occurred_at: at(0),
        })
    }

    fn transfer(from: &str, to: &str, code: &str, transfer_id: &str, minute: u32) -> LibraryCommand {
        LibraryCommand::TransferBook(TransferBook {
            library_id: id(from),
            isbn: code.to_string(),
            to_library_id: id(to),
            transfer_id: transfer_id.to_string(),
            occurred_at: at(minute),
        })
    }

    const EJ: &str = "978-0134685991";
    const RB: &str = "978-1593278281";

    #[test]
    fn create_library_yields_an_empty_catalog_row() {
        let engine = engine();
        let outcome = engine.submit_library(create_library("lib1", "Central")).unwrap();
        assert_eq!(outcome.new_version, Some(0));

        engine.settle().unwrap();
        assert_eq!(
            engine.catalog().get(&id("lib1")),
            Some(LibraryRow {
                library_id: id("lib1"),
                name: "Central".to_string(),
                books: vec![],
            })
        );
    }

    #[test]
    fn duplicate_isbn_is_rejected_and_appends_nothing() {
        let engine = engine();
        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(add_book("lib1", EJ, None, 1)).unwrap();

        let err = engine.submit_library(add_book("lib1", EJ, None, 2)).unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { ref kind, .. } if kind == rejection::DUPLICATE_ISBN));

        let stream = StreamId::for_aggregate("library", &id("lib1"));
        assert_eq!(engine.log().stream_version(&stream).unwrap(), Some(1));
    }

    #[test]
    fn hyphenation_does_not_make_a_different_isbn() {
        let engine = engine();
        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(add_book("lib1", EJ, None, 1)).unwrap();

        let err = engine
            .submit_library(add_book("lib1", "9780134685991", None, 2))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { ref kind, .. } if kind == rejection::DUPLICATE_ISBN));

        engine.settle().unwrap();
        let held: Vec<_> = engine
            .catalog()
            .get(&id("lib1"))
            .unwrap()
            .books
            .iter()
            .map(|b| b.isbn.clone())
            .collect();
        assert_eq!(held, vec![isbn("9780134685991")]);

        let outcome = engine
            .submit_library(LibraryCommand::RemoveBook(RemoveBook {
                library_id: id("lib1"),
                isbn: "9780134685991".to_string(),
                occurred_at: at(3),
            }))
            .unwrap();
        assert_eq!(outcome.new_version, Some(2));

        engine.settle().unwrap();
        assert!(engine.catalog().get(&id("lib1")).unwrap().books.is_empty());
    }

    #[test]
    fn stale_expected_version_is_a_concurrency_error() {
        let engine = engine();
        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(add_book("lib1", EJ, None, 1)).unwrap();

        let stale = folio_events::CommandEnvelope::new(add_book("lib1", RB, None, 2))
            .expecting(ExpectedVersion::Exact(0));
        let err = engine.dispatcher().submit::<Library>(stale).unwrap_err();
        assert!(matches!(err, DispatchError::Concurrency(_)));
    }

    #[test]
    fn read_models_follow_commands_across_aggregates() {
        let engine = engine();
        engine.submit_publisher(register_publisher("pub1", "No Starch")).unwrap();
        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(create_library("lib2", "Branch")).unwrap();
        engine.submit_library(add_book("lib1", RB, Some("pub1"), 1)).unwrap();
        engine.submit_library(add_book("lib2", RB, Some("pub1"), 2)).unwrap();
        engine.submit_library(add_book("lib1", EJ, None, 3)).unwrap();
        engine
            .submit_library(LibraryCommand::RemoveBook(RemoveBook {
                library_id: id("lib1"),
                isbn: RB.to_string(),
                occurred_at: at(4),
            }))
            .unwrap();

        engine.settle().unwrap();

        let holders: Vec<_> = engine
            .catalog()
            .libraries_holding(&isbn(RB))
            .into_iter()
            .map(|row| row.library_id)
            .collect();
        assert_eq!(holders, vec![id("lib2")]);
        assert_eq!(engine.directory().get(&id("pub1")).unwrap().name, "No Starch");

        // The removal at lib1 is later than lib2's addition: the shared entry is gone.
        let view = engine.publisher_catalog().get(&id("pub1")).unwrap();
        assert_eq!(view.name.as_deref(), Some("No Starch"));
        assert!(view.books.is_empty());
        assert!(engine.health().is_healthy());
    }

    #[test]
    fn rebuild_equals_incremental_maintenance() {
        let engine = engine();
        engine.submit_publisher(register_publisher("pub1", "No Starch")).unwrap();
        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(create_library("lib2", "Branch")).unwrap();
        engine.submit_library(add_book("lib1", RB, Some("pub1"), 1)).unwrap();
        engine.submit_library(add_book("lib1", EJ, Some("pub1"), 2)).unwrap();
        engine.submit_library(transfer("lib1", "lib2", RB, "t1", 3)).unwrap();
        engine.settle().unwrap();

        let catalog = engine.catalog().list();
        let directory = engine.directory().list();
        let joined = engine.publisher_catalog().list();
        let sagas = engine.transfers().instances();
        let submitted = engine.log().len();

        engine.rebuild_all().unwrap();

        assert_eq!(engine.catalog().list(), catalog);
        assert_eq!(engine.directory().list(), directory);
        assert_eq!(engine.publisher_catalog().list(), joined);
        // Saga state is rebuilt without issuing commands again.
        assert_eq!(engine.transfers().instances(), sagas);
        assert_eq!(engine.log().len(), submitted);
    }

    #[test]
    fn transfer_completes_at_the_destination() {
        let engine = engine();
        engine.submit_publisher(register_publisher("pub1", "No Starch")).unwrap();
        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(create_library("lib2", "Branch")).unwrap();
        engine.submit_library(add_book("lib1", RB, Some("pub1"), 1)).unwrap();
        engine.submit_library(transfer("lib1", "lib2", RB, "t1", 2)).unwrap();

        engine.settle().unwrap();

        let saga = engine.transfers().instance("t1").unwrap();
        assert_eq!(saga.state.phase, TransferPhase::Completed);
        assert!(!engine.catalog().get(&id("lib1")).unwrap().holds(&isbn(RB)));
        assert!(engine.catalog().get(&id("lib2")).unwrap().holds(&isbn(RB)));

        // The arrival carries the publisher, so the joined view still lists the book.
        let view = engine.publisher_catalog().get(&id("pub1")).unwrap();
        assert_eq!(view.books.len(), 1);

        // Nothing left to time out.
        assert_eq!(engine.tick(at(59)).unwrap(), 0);
    }

    #[test]
    fn unreachable_destination_times_out_and_compensates() {
        let engine = engine();
        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(add_book("lib1", RB, None, 1)).unwrap();
        // "nowhere" was never created: the arrival command is refused.
        engine.submit_library(transfer("lib1", "nowhere", RB, "t9", 2)).unwrap();
        engine.settle().unwrap();

        assert_eq!(engine.transfers().instance("t9").unwrap().state.phase, TransferPhase::Started);
        assert!(!engine.catalog().get(&id("lib1")).unwrap().holds(&isbn(RB)));

        assert_eq!(engine.tick(at(2) + ChronoDuration::minutes(5)).unwrap(), 0);
        assert_eq!(engine.tick(at(2) + ChronoDuration::minutes(10)).unwrap(), 1);

        let saga = engine.transfers().instance("t9").unwrap();
        assert_eq!(saga.state.phase, TransferPhase::Compensated);
        assert!(engine.catalog().get(&id("lib1")).unwrap().holds(&isbn(RB)));
    }

    #[test]
    fn legacy_book_added_revisions_are_upcast_on_every_path() {
        let engine = engine();
        engine.submit_library(create_library("lib1", "Central")).unwrap();

        // A revision-1 record written by an older release.
        let stream = StreamId::for_aggregate("library", &id("lib1"));
        engine
            .log()
            .append(
                &stream,
                ExpectedVersion::Exact(0),
                vec![UncommittedEvent {
                    event_id: EventId::new(),
                    aggregate_type: "library".to_string(),
                    aggregate_id: id("lib1"),
                    event_type: LibraryEvent::BOOK_ADDED.to_string(),
                    schema_revision: 1,
                    occurred_at: at(1),
                    payload: json!({
                        "library_id": "lib1",
                        "isbn": format!(" {RB} "),
                        "name": "The Rust Book",
                        "occurred_at": at(1),
                    }),
                }],
            )
            .unwrap();

        engine.settle().unwrap();
        let row = engine.catalog().get(&id("lib1")).unwrap();
        assert_eq!(row.books.len(), 1);
        assert_eq!(row.books[0].title, "The Rust Book");
        assert_eq!(row.books[0].isbn, isbn(RB));

        // The write side sees the same book.
        let err = engine.submit_library(add_book("lib1", RB, None, 2)).unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { .. }));
    }

    #[test]
    fn unknown_future_revision_degrades_its_stream_only() {
        let engine = engine();
        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(create_library("lib2", "Branch")).unwrap();

        let stream = StreamId::for_aggregate("library", &id("lib1"));
        engine
            .log()
            .append(
                &stream,
                ExpectedVersion::Exact(0),
                vec![UncommittedEvent {
                    event_id: EventId::new(),
                    aggregate_type: "library".to_string(),
                    aggregate_id: id("lib1"),
                    event_type: LibraryEvent::BOOK_ADDED.to_string(),
                    schema_revision: 9,
                    occurred_at: at(1),
                    payload: json!({}),
                }],
            )
            .unwrap();
        engine.submit_library(add_book("lib2", EJ, None, 2)).unwrap();

        engine.settle().unwrap();

        let health = engine.health();
        assert!(!health.is_healthy());
        assert!(health.degraded.iter().all(|d| d.stream == stream));
        assert!(engine.catalog().get(&id("lib2")).unwrap().holds(&isbn(EJ)));
    }

    /// Fails on one stream until told otherwise.
    struct Flaky {
        broken: StreamId,
        healed: std::sync::atomic::AtomicBool,
        applied: std::sync::Mutex<std::collections::HashMap<StreamId, u64>>,
    }

    impl EventHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn handles(&self, _event_type: &str) -> bool {
            true
        }

        fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionApplyError> {
            if envelope.stream_id() == &self.broken && !self.healed.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ProjectionApplyError::Store("disk full".to_string()));
            }
            self.applied
                .lock()
                .unwrap()
                .insert(envelope.stream_id().clone(), envelope.sequence_number());
            Ok(())
        }

        fn last_applied(&self, stream_id: &StreamId) -> Option<u64> {
            self.applied.lock().unwrap().get(stream_id).copied()
        }
    }

    #[test]
    fn degraded_pair_can_be_cleared_after_the_fault_is_fixed() {
        let engine = engine();
        let broken = StreamId::for_aggregate("library", &id("lib1"));
        let flaky = Arc::new(Flaky {
            broken: broken.clone(),
            healed: Default::default(),
            applied: Default::default(),
        });
        let pipeline = DeliveryPipeline::new(
            engine.log().clone(),
            Arc::new(crate::engine::upcasters()),
            engine.config(),
        )
        .register(flaky.clone());

        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(create_library("lib2", "Branch")).unwrap();
        engine.submit_library(add_book("lib1", EJ, None, 1)).unwrap();
        pipeline.settle().unwrap();

        assert!(pipeline.is_degraded("flaky", &broken));
        assert_eq!(flaky.last_applied(&broken), None);
        assert_eq!(
            flaky.last_applied(&StreamId::for_aggregate("library", &id("lib2"))),
            Some(0)
        );

        flaky.healed.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(pipeline.clear_degraded("flaky", &broken).unwrap());
        assert_eq!(flaky.last_applied(&broken), Some(1));
        assert!(pipeline.health().is_healthy());
    }

    #[test]
    fn background_worker_keeps_read_models_current() {
        let engine = engine();
        let worker = engine.spawn_worker();

        engine.submit_library(create_library("lib1", "Central")).unwrap();
        engine.submit_library(add_book("lib1", EJ, None, 1)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.catalog().get(&id("lib1")).is_none_or(|row| row.books.is_empty())
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        worker.shutdown();

        assert!(engine.catalog().get(&id("lib1")).unwrap().holds(&isbn(EJ)));
    }

    #[test]
    fn concurrent_submits_to_one_library_serialize() {
        let engine = Arc::new(engine());
        engine.submit_library(create_library("lib1", "Central")).unwrap();

        let codes = ["978-0134685991", "978-1593278281", "978-1491927281", "978-1718503106"];
        let handles: Vec<_> = codes
            .iter()
            .enumerate()
            .map(|(i, code)| {
                let engine = engine.clone();
                let command = add_book("lib1", code, None, i as u32 + 1);
                std::thread::spawn(move || engine.submit_library(command))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        let stream = StreamId::for_aggregate("library", &id("lib1"));
        assert_eq!(engine.log().stream_version(&stream).unwrap(), Some(4));
        engine.settle().unwrap();
        assert_eq!(engine.catalog().get(&id("lib1")).unwrap().books.len(), 4);
    }
}
