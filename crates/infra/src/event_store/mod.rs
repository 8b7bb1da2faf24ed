//! Append-only event log boundary.
//!
//! This module defines an infrastructure-facing abstraction for storing and
//! reading event streams without making any storage assumptions.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventLog;
pub use r#trait::{EventLog, EventStoreError, PagedRead, ReadScope, StoredEvent, UncommittedEvent};
