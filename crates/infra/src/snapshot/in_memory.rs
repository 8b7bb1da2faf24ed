use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use folio_core::StreamId;

use super::{Snapshot, SnapshotError, SnapshotStore};

/// In-memory snapshot store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    inner: RwLock<HashMap<StreamId, BTreeMap<u64, Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots kept for a stream.
    pub fn count(&self, stream_id: &StreamId) -> usize {
        self.inner
            .read()
            .ok()
            .and_then(|m| m.get(stream_id).map(BTreeMap::len))
            .unwrap_or(0)
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| SnapshotError::Backend("lock poisoned".to_string()))?;
        map.entry(snapshot.stream_id.clone())
            .or_default()
            .insert(snapshot.sequence_number, snapshot);
        Ok(())
    }

    fn latest_before(&self, stream_id: &StreamId, bound: u64) -> Result<Option<Snapshot>, SnapshotError> {
        let map = self
            .inner
            .read()
            .map_err(|_| SnapshotError::Backend("lock poisoned".to_string()))?;
        Ok(map
            .get(stream_id)
            .and_then(|by_seq| by_seq.range(..=bound).next_back())
            .map(|(_, s)| s.clone()))
    }

    fn delete_stream(&self, stream_id: &StreamId) -> Result<(), SnapshotError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| SnapshotError::Backend("lock poisoned".to_string()))?;
        map.remove(stream_id);
        Ok(())
    }
}
