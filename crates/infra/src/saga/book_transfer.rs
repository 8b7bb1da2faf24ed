//! Book transfer saga.
//!
//! Orchestrates moving a book between two libraries:
//! 1. `BookTransferredOut` on the source → add the book at the destination
//! 2. `BookAdded` with the transfer id on the destination → completed
//!
//! Compensating action: if the arrival is not observed before the timeout,
//! add the book back to the source library. Observing that return marks the
//! saga compensated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use folio_core::AggregateId;
use folio_events::{EventEnvelope, ProjectionApplyError, Saga, SagaInstance, Transition, decode_payload};
use folio_library::{AddBook, Isbn, LibraryCommand, LibraryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    /// Opened by the outgoing transfer; arrival not requested yet.
    Started,
    /// Arrival requested at the destination.
    AwaitingArrival,
    Completed,
    /// Deadline passed; the book is being returned to its source.
    TimedOut,
    Compensated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookTransferState {
    pub phase: TransferPhase,
    pub source: AggregateId,
    pub destination: AggregateId,
    pub isbn: Isbn,
    pub title: String,
    pub publisher_id: Option<AggregateId>,
}

impl BookTransferState {
    fn with_phase(&self, phase: TransferPhase) -> Self {
        Self {
            phase,
            ..self.clone()
        }
    }

    fn add_book_to(&self, library_id: &AggregateId, transfer_id: &str, at: DateTime<Utc>) -> LibraryCommand {
        LibraryCommand::AddBook(AddBook {
            library_id: library_id.clone(),
            isbn: self.isbn.as_str().to_string(),
            title: self.title.clone(),
            publisher_id: self.publisher_id.clone(),
            transfer_id: Some(transfer_id.to_string()),
            occurred_at: at,
        })
    }
}

pub struct BookTransferSaga;

impl BookTransferSaga {
    pub const ARRIVAL: &'static str = "arrival";
    pub const RETURN: &'static str = "return_to_source";

    fn library_event(envelope: &EventEnvelope<JsonValue>) -> Result<Option<LibraryEvent>, ProjectionApplyError> {
        match envelope.event_type() {
            LibraryEvent::BOOK_TRANSFERRED_OUT | LibraryEvent::BOOK_ADDED => {
                Ok(Some(decode_payload(envelope.event_type(), envelope.payload())?))
            }
            _ => Ok(None),
        }
    }
}

impl Saga for BookTransferSaga {
    type State = BookTransferState;
    type Command = LibraryCommand;

    fn saga_type() -> &'static str {
        "saga.book_transfer"
    }

    fn correlate(envelope: &EventEnvelope<JsonValue>) -> Result<Option<String>, ProjectionApplyError> {
        Ok(match Self::library_event(envelope)? {
            Some(LibraryEvent::BookTransferredOut(e)) => Some(e.transfer_id),
            Some(LibraryEvent::BookAdded(e)) => e.transfer_id,
            _ => None,
        })
    }

    fn start(
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<Transition<Self::State, Self::Command>>, ProjectionApplyError> {
        let Some(LibraryEvent::BookTransferredOut(e)) = Self::library_event(envelope)? else {
            return Ok(None);
        };

        let state = BookTransferState {
            phase: TransferPhase::Started,
            source: e.library_id,
            destination: e.to_library_id,
            isbn: e.isbn,
            title: e.title,
            publisher_id: e.publisher_id,
        };
        let arrival = state.add_book_to(&state.destination, &e.transfer_id, envelope.timestamp());

        Ok(Some(
            Transition::to(state)
                .awaiting(Self::ARRIVAL)
                .sending(arrival),
        ))
    }

    fn react(
        instance: &SagaInstance<Self::State>,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Option<Transition<Self::State, Self::Command>>, ProjectionApplyError> {
        let Some(LibraryEvent::BookAdded(e)) = Self::library_event(envelope)? else {
            return Ok(None);
        };
        let state = &instance.state;

        let next = match state.phase {
            TransferPhase::Started | TransferPhase::AwaitingArrival if e.library_id == state.destination => {
                TransferPhase::Completed
            }
            // The return may be observed before this process evaluated the timeout
            // (e.g. during a rebuild); it is a compensation either way.
            TransferPhase::Started | TransferPhase::AwaitingArrival | TransferPhase::TimedOut
                if e.library_id == state.source =>
            {
                TransferPhase::Compensated
            }
            _ => return Ok(None),
        };

        Ok(Some(Transition::to(state.with_phase(next))))
    }

    fn on_timeout(
        instance: &SagaInstance<Self::State>,
        now: DateTime<Utc>,
    ) -> Option<Transition<Self::State, Self::Command>> {
        let state = &instance.state;
        match state.phase {
            TransferPhase::Started | TransferPhase::AwaitingArrival => {
                let back = state.add_book_to(&state.source, &instance.correlation_key, now);
                Some(
                    Transition::to(state.with_phase(TransferPhase::TimedOut))
                        .awaiting(Self::RETURN)
                        .sending(back),
                )
            }
            _ => None,
        }
    }

    fn dispatched(state: &Self::State) -> Option<Self::State> {
        (state.phase == TransferPhase::Started).then(|| state.with_phase(TransferPhase::AwaitingArrival))
    }

    fn is_terminal(state: &Self::State) -> bool {
        matches!(state.phase, TransferPhase::Completed | TransferPhase::Compensated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{StoredEvent, UncommittedEvent};
    use crate::saga::SagaCoordinator;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use folio_core::StreamId;
    use folio_events::EventHandler;
    use folio_library::{BookAdded, BookTransferredOut};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Sent = Arc<Mutex<Vec<LibraryCommand>>>;

    fn id(s: &str) -> AggregateId {
        AggregateId::new(s).unwrap()
    }

    fn isbn() -> Isbn {
        Isbn::parse("978-0134685991").unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn envelope(lib: &str, seq: u64, event: LibraryEvent) -> EventEnvelope<JsonValue> {
        let u = UncommittedEvent::from_typed("library", id(lib), &event).unwrap();
        StoredEvent {
            event_id: u.event_id,
            stream_id: StreamId::for_aggregate("library", &id(lib)),
            aggregate_type: u.aggregate_type,
            aggregate_id: u.aggregate_id,
            sequence_number: seq,
            global_position: seq,
            event_type: u.event_type,
            schema_revision: u.schema_revision,
            occurred_at: u.occurred_at,
            payload: u.payload,
        }
        .into_envelope()
    }

    fn transferred_out(seq: u64) -> EventEnvelope<JsonValue> {
        envelope(
            "src",
            seq,
            LibraryEvent::BookTransferredOut(BookTransferredOut {
                library_id: id("src"),
                isbn: isbn(),
                title: "Effective Java".to_string(),
                publisher_id: Some(id("pub1")),
                to_library_id: id("dst"),
                transfer_id: "t1".to_string(),
                occurred_at: t0(),
            }),
        )
    }

    fn arrived_at(lib: &str, seq: u64) -> EventEnvelope<JsonValue> {
        envelope(
            lib,
            seq,
            LibraryEvent::BookAdded(BookAdded {
                library_id: id(lib),
                isbn: isbn(),
                title: "Effective Java".to_string(),
                publisher_id: Some(id("pub1")),
                transfer_id: Some("t1".to_string()),
                occurred_at: t0() + ChronoDuration::seconds(5),
            }),
        )
    }

    fn coordinator(
        fail: bool,
    ) -> (
        SagaCoordinator<BookTransferSaga, impl Fn(LibraryCommand) -> Result<(), String> + Send + Sync>,
        Sent,
    ) {
        let sent: Sent = Arc::default();
        let sink = sent.clone();
        let executor = move |cmd: LibraryCommand| {
            sink.lock().unwrap().push(cmd);
            if fail { Err("destination unavailable".to_string()) } else { Ok(()) }
        };
        (SagaCoordinator::new(executor, Duration::from_secs(60)), sent)
    }

    #[test]
    fn transfer_out_requests_arrival_and_awaits_it() {
        let (saga, sent) = coordinator(false);
        saga.observe(&transferred_out(3)).unwrap();

        let instance = saga.instance("t1").unwrap();
        assert_eq!(instance.state.phase, TransferPhase::AwaitingArrival);
        assert_eq!(instance.pending_steps, vec![BookTransferSaga::ARRIVAL.to_string()]);
        assert_eq!(instance.saga_id, "saga.book_transfer-t1");
        assert_eq!(instance.started_at, t0());

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            LibraryCommand::AddBook(cmd) => {
                assert_eq!(cmd.library_id, id("dst"));
                assert_eq!(cmd.transfer_id.as_deref(), Some("t1"));
                assert_eq!(cmd.publisher_id, Some(id("pub1")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn arrival_completes_the_transfer() {
        let (saga, _) = coordinator(false);
        saga.observe(&transferred_out(0)).unwrap();
        saga.observe(&arrived_at("dst", 0)).unwrap();

        let instance = saga.instance("t1").unwrap();
        assert_eq!(instance.state.phase, TransferPhase::Completed);
        assert!(instance.pending_steps.is_empty());
        assert!(saga.active().is_empty());

        // Terminal instances never time out.
        assert_eq!(saga.tick(t0() + ChronoDuration::hours(1)), 0);
    }

    #[test]
    fn failed_arrival_command_leaves_the_saga_started() {
        let (saga, sent) = coordinator(true);
        saga.observe(&transferred_out(0)).unwrap();

        assert_eq!(saga.instance("t1").unwrap().state.phase, TransferPhase::Started);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn timeout_returns_the_book_and_the_return_compensates() {
        let (saga, sent) = coordinator(false);
        saga.observe(&transferred_out(0)).unwrap();

        assert_eq!(saga.tick(t0() + ChronoDuration::seconds(59)), 0);
        let now = t0() + ChronoDuration::seconds(60);
        assert_eq!(saga.tick(now), 1);

        let instance = saga.instance("t1").unwrap();
        assert_eq!(instance.state.phase, TransferPhase::TimedOut);
        assert_eq!(instance.pending_steps, vec![BookTransferSaga::RETURN.to_string()]);

        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            match &sent[1] {
                LibraryCommand::AddBook(cmd) => {
                    assert_eq!(cmd.library_id, id("src"));
                    assert_eq!(cmd.occurred_at, now);
                }
                other => panic!("unexpected command {other:?}"),
            }
        }

        // A second tick does not fire again.
        assert_eq!(saga.tick(now + ChronoDuration::seconds(1)), 0);

        // A late arrival at the destination is ignored once timed out.
        saga.observe(&arrived_at("dst", 0)).unwrap();
        assert_eq!(saga.instance("t1").unwrap().state.phase, TransferPhase::TimedOut);

        saga.observe(&arrived_at("src", 1)).unwrap();
        assert_eq!(saga.instance("t1").unwrap().state.phase, TransferPhase::Compensated);
    }

    #[test]
    fn redelivered_events_are_skipped() {
        let (saga, sent) = coordinator(false);
        saga.observe(&transferred_out(0)).unwrap();
        saga.observe(&transferred_out(0)).unwrap();

        assert_eq!(saga.instances().len(), 1);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn uncorrelated_events_only_advance_the_cursor() {
        let (saga, _) = coordinator(false);
        let plain = envelope(
            "src",
            0,
            LibraryEvent::BookAdded(BookAdded {
                library_id: id("src"),
                isbn: isbn(),
                title: "Effective Java".to_string(),
                publisher_id: None,
                transfer_id: None,
                occurred_at: t0(),
            }),
        );
        saga.observe(&plain).unwrap();

        assert!(saga.instances().is_empty());
        assert_eq!(saga.last_applied(plain.stream_id()), Some(0));

        let err = saga.observe(&transferred_out(2)).unwrap_err();
        assert!(matches!(err, ProjectionApplyError::SequenceGap { .. }));
    }
}
