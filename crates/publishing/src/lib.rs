//! `folio-publishing` — the Publisher aggregate.

pub mod publisher;

pub use publisher::{
    Publisher, PublisherCommand, PublisherEvent, PublisherRegistered, PublisherRenamed,
    RegisterPublisher, RenamePublisher, rejection,
};
