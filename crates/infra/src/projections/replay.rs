//! Rebuilding read models from the log.
//!
//! A rebuild resets a handler (documents and cursors) and replays the whole log
//! from global position zero through the upcaster registry. Because handlers
//! are idempotent and order-aware per stream, the result equals incremental
//! maintenance.

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use folio_events::{EventHandler, ProjectionApplyError, Upcasters};

use crate::event_store::{EventLog, EventStoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("event log error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("handler {handler} failed at global position {position}: {source}")]
    Projection {
        handler: String,
        position: u64,
        source: ProjectionApplyError,
    },
}

/// A handler whose state can be wiped for a rebuild.
pub trait Rebuildable: EventHandler {
    fn reset(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReplayStats {
    /// Events read from the log.
    pub events: u64,
    /// Global position after the last replayed event.
    pub next_position: u64,
}

/// Reset `handler` and feed it the entire log.
pub fn rebuild<L, H>(
    log: &L,
    upcasters: &Upcasters,
    page_size: usize,
    handler: &H,
) -> Result<ReplayStats, ReplayError>
where
    L: EventLog,
    H: Rebuildable + ?Sized,
{
    handler.reset();
    let stats = replay_from(log, upcasters, page_size, 0, handler)?;
    info!(handler = handler.name(), events = stats.events, "rebuild complete");
    Ok(stats)
}

/// Feed `handler` every event from `from_position` on, without resetting it.
pub fn replay_from<L, H>(
    log: &L,
    upcasters: &Upcasters,
    page_size: usize,
    from_position: u64,
    handler: &H,
) -> Result<ReplayStats, ReplayError>
where
    L: EventLog,
    H: EventHandler + ?Sized,
{
    let mut stats = ReplayStats {
        events: 0,
        next_position: from_position,
    };

    for stored in log.read_all(from_position, page_size) {
        let stored = stored?;
        let position = stored.global_position;
        let envelope = upcasters
            .upcast_envelope(stored.into_envelope())
            .map_err(|err| {
                error!(handler = handler.name(), position, error = %err, "upcast failed during replay");
                ReplayError::Projection {
                    handler: handler.name().to_string(),
                    position,
                    source: err.into(),
                }
            })?;

        handler
            .handle(&envelope)
            .map_err(|source| ReplayError::Projection {
                handler: handler.name().to_string(),
                position,
                source,
            })?;

        stats.events += 1;
        stats.next_position = position + 1;
    }

    Ok(stats)
}
