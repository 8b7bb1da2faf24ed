//! Projection cursor persistence.
//!
//! A cursor is the last applied sequence number per (handler, stream). It makes
//! handlers idempotent (replays at or below the cursor are skipped), lets them
//! resume after a restart and detects gaps.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use folio_core::StreamId;

pub trait ProjectionCursorStore: Send + Sync {
    fn get_cursor(&self, handler: &str, stream_id: &StreamId) -> Option<u64>;

    fn update_cursor(&self, handler: &str, stream_id: &StreamId, sequence_number: u64);

    /// Forget every cursor of a handler (rebuild support).
    fn clear_cursors(&self, handler: &str);
}

impl<S> ProjectionCursorStore for Arc<S>
where
    S: ProjectionCursorStore + ?Sized,
{
    fn get_cursor(&self, handler: &str, stream_id: &StreamId) -> Option<u64> {
        (**self).get_cursor(handler, stream_id)
    }

    fn update_cursor(&self, handler: &str, stream_id: &StreamId, sequence_number: u64) {
        (**self).update_cursor(handler, stream_id, sequence_number)
    }

    fn clear_cursors(&self, handler: &str) {
        (**self).clear_cursors(handler)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursors: RwLock<HashMap<String, HashMap<StreamId, u64>>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProjectionCursorStore for InMemoryCursorStore {
    fn get_cursor(&self, handler: &str, stream_id: &StreamId) -> Option<u64> {
        let cursors = self.cursors.read().ok()?;
        cursors.get(handler)?.get(stream_id).copied()
    }

    fn update_cursor(&self, handler: &str, stream_id: &StreamId, sequence_number: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors
                .entry(handler.to_string())
                .or_default()
                .insert(stream_id.clone(), sequence_number);
        }
    }

    fn clear_cursors(&self, handler: &str) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.remove(handler);
        }
    }
}

/// Outcome of checking an incoming sequence number against a cursor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CursorCheck {
    /// Next in line; apply it.
    Next,
    /// At or below the cursor; already applied.
    Duplicate,
    /// Something in between is missing.
    Gap,
}

pub fn check_sequence(last: Option<u64>, found: u64) -> CursorCheck {
    match last {
        Some(last) if found <= last => CursorCheck::Duplicate,
        Some(last) if found == last + 1 => CursorCheck::Next,
        None if found == 0 => CursorCheck::Next,
        _ => CursorCheck::Gap,
    }
}
