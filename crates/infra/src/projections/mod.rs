//! Projection implementations (read model builders).
//!
//! Projections consume committed events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: can be reconstructed from the log
//! - **Idempotent**: safe for at-least-once delivery

pub mod cursor_store;
pub mod engine;
pub mod replay;

// Single-entity read models
pub mod library_catalog;
pub mod publisher_directory;

// Cross-aggregate join
pub mod publisher_catalog;

pub use cursor_store::{InMemoryCursorStore, ProjectionCursorStore};
pub use engine::ProjectionEngine;
pub use replay::{Rebuildable, ReplayError, ReplayStats, rebuild, replay_from};

pub use library_catalog::{CatalogBook, LibraryCatalogProjection, LibraryRow};
pub use publisher_catalog::{
    PublishedBook, PublisherCatalog, PublisherCatalogJoin, PublisherDocument, Stamp,
};
pub use publisher_directory::{PublisherDirectoryProjection, PublisherRow};
