use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Keyed document store abstraction for disposable read models.
///
/// Read models are caches over the log: every operation is best effort and a
/// full rebuild restores them.
pub trait DocumentStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn upsert(&self, key: K, value: V);
    fn delete(&self, key: &K);
    /// Every document, ordered by key.
    fn list(&self) -> Vec<V>;
    /// Documents matching a predicate, ordered by key.
    fn query(&self, filter: &dyn Fn(&V) -> bool) -> Vec<V>;
    /// Drop every document (rebuild support).
    fn clear(&self);
}

impl<K, V, S> DocumentStore<K, V> for Arc<S>
where
    S: DocumentStore<K, V> + ?Sized,
{
    fn get(&self, key: &K) -> Option<V> {
        (**self).get(key)
    }

    fn upsert(&self, key: K, value: V) {
        (**self).upsert(key, value)
    }

    fn delete(&self, key: &K) {
        (**self).delete(key)
    }

    fn list(&self) -> Vec<V> {
        (**self).list()
    }

    fn query(&self, filter: &dyn Fn(&V) -> bool) -> Vec<V> {
        (**self).query(filter)
    }

    fn clear(&self) {
        (**self).clear()
    }
}

/// In-memory ordered store for tests/dev.
#[derive(Debug)]
pub struct InMemoryDocumentStore<K, V> {
    inner: RwLock<BTreeMap<K, V>>,
}

impl<K, V> InMemoryDocumentStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Every mutation is a single map call, so a writer that panicked left the
    // map consistent; recover its guard instead of dropping the write.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<K, V>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<K, V>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl<K, V> Default for InMemoryDocumentStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> DocumentStore<K, V> for InMemoryDocumentStore<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    fn upsert(&self, key: K, value: V) {
        self.write().insert(key, value);
    }

    fn delete(&self, key: &K) {
        self.write().remove(key);
    }

    fn list(&self) -> Vec<V> {
        self.read().values().cloned().collect()
    }

    fn query(&self, filter: &dyn Fn(&V) -> bool) -> Vec<V> {
        self.read().values().filter(|v| filter(*v)).cloned().collect()
    }

    fn clear(&self) {
        self.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_ordered_by_key() {
        let store = InMemoryDocumentStore::new();
        store.upsert("b".to_string(), 2);
        store.upsert("a".to_string(), 1);
        store.upsert("c".to_string(), 3);

        assert_eq!(store.list(), vec![1, 2, 3]);
        assert_eq!(store.query(&|v| *v != 2), vec![1, 3]);
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let store = InMemoryDocumentStore::new();
        store.upsert(1u32, "old");
        store.upsert(1u32, "new");
        assert_eq!(store.get(&1), Some("new"));

        store.delete(&1);
        assert_eq!(store.get(&1), None);

        store.upsert(2u32, "x");
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn writes_still_land_after_a_writer_panicked() {
        let store = Arc::new(InMemoryDocumentStore::<u32, &str>::new());
        store.upsert(1, "kept");

        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.write().unwrap();
            panic!("handler panicked mid-write");
        })
        .join();
        assert!(store.inner.is_poisoned());

        store.upsert(2, "after");
        store.delete(&1);
        assert_eq!(store.get(&2), Some("after"));
        assert_eq!(store.list(), vec!["after"]);
        assert_eq!(store.len(), 1);
    }
}
