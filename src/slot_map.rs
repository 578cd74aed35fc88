//! Concurrent key-value map with a live entry count
//!
//! `SlotMap` is the storage primitive underneath the indexed cache and the
//! container table. It is a thin layer over [`DashMap`] that keeps an atomic
//! count of live entries, so `len()` never has to walk every shard.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct SlotMap<K, V>
where
    K: Eq + Hash,
{
    inner: DashMap<K, V>,
    count: AtomicUsize,
}

impl<K, V> Default for SlotMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: DashMap::new(),
            count: AtomicUsize::new(0),
        }
    }
}

impl<K, V> SlotMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a clone of the value stored under `key`
    pub fn load(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|v| v.value().clone())
    }

    /// Store `value` under `key`, returning the value it replaced
    pub fn store(&self, key: K, value: V) -> Option<V> {
        let previous = self.inner.insert(key, value);
        if previous.is_none() {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        previous
    }

    /// Return the existing value for `key`, or store and return `value`.
    ///
    /// The boolean is `true` when an existing value was loaded.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        match self.inner.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                let stored = entry.insert(value).value().clone();
                self.count.fetch_add(1, Ordering::SeqCst);
                (stored, false)
            }
        }
    }

    /// Remove `key`, returning the value it held
    pub fn load_and_delete(&self, key: &K) -> Option<V> {
        let removed = self.inner.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn delete(&self, key: &K) -> bool {
        self.load_and_delete(key).is_some()
    }

    /// Remove `key` only while `predicate` holds for its current value
    pub fn delete_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let removed = self.inner.remove_if(key, |_, v| predicate(v)).map(|(_, v)| v);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Visit every entry until `f` returns false.
    ///
    /// Iteration order is unspecified. `f` must not write to this map.
    pub fn range(&self, mut f: impl FnMut(&K, &V) -> bool) {
        for entry in self.inner.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.iter().map(|e| e.value().clone()).collect()
    }
}
