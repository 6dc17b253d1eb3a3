//! Typed concurrent registry keyed by opaque identifiers.

use std::fmt;
use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Thread-safe map with load/store/delete/range semantics.
///
/// Closures passed to [`Registry::update`] and [`Registry::range`] run while a
/// shard lock is held and must not call back into the same registry.
pub struct Registry<K, V> {
    inner: DashMap<K, V>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Store a value, returning the previous one.
    pub fn store(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    /// Store a value only if the key is vacant. Returns whether it was stored.
    pub fn store_if_absent(&self, key: K, value: V) -> bool {
        match self.inner.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Remove a value.
    pub fn delete(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    /// Mutate a value in place.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.inner.get_mut(key).map(|mut value| f(value.value_mut()))
    }

    /// Visit every entry until `f` returns false.
    pub fn range(&self, mut f: impl FnMut(&K, &V) -> bool) {
        for entry in self.inner.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Load a copy of a value.
    pub fn load(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|value| value.value().clone())
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<K> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of all values.
    pub fn values(&self) -> Vec<V> {
        self.inner.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.inner.len())
            .finish()
    }
}
