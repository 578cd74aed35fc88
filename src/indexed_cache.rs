//! Multi-index record cache
//!
//! Records are stored under every `(field, value)` pair their
//! [`Indexed::field_map`] reports, so each field can be queried
//! independently. All index mutation for one upsert or delete happens under a
//! single write lock, so a reader never sees a record present under some
//! indexes and missing from others.
//!
//! Index values are unique keys: if upserting a record collides with another
//! record on any field, that other record is evicted from every index before
//! the new one is stored. This is what makes an update of the same identity
//! drop its stale index entries.
//!
//! Empty field values are never indexed.

use crate::slot_map::SlotMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Name of the identity index, used for canonical enumeration
pub const ID_INDEX: &str = "id";

/// `(index name, index key)` pairs for one record
pub type FieldMap = Vec<(&'static str, String)>;

/// A record that can be stored in an [`IndexedCache`]
pub trait Indexed {
    /// Indexed fields of this record. Must include [`ID_INDEX`].
    fn field_map(&self) -> FieldMap;
}

type Index<T> = SlotMap<String, Arc<T>>;

pub struct IndexedCache<T> {
    name: String,
    indexes: SlotMap<String, Arc<Index<T>>>,
    lock: RwLock<()>,
}

impl<T: Indexed> IndexedCache<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: SlotMap::new(),
            lock: RwLock::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace a record, returning the stored handle
    pub fn upsert(&self, item: T) -> Arc<T> {
        let item = Arc::new(item);
        let fields = non_empty_fields(item.as_ref());

        let _guard = self.lock.write();

        // Every record currently holding one of our keys is displaced
        let mut displaced: Vec<Arc<T>> = Vec::new();
        for (field, value) in &fields {
            if let Some(holder) = self.index(field).load(value) {
                if !displaced.iter().any(|d| Arc::ptr_eq(d, &holder)) {
                    displaced.push(holder);
                }
            }
        }
        for holder in &displaced {
            self.remove_entries(holder);
        }

        for (field, value) in fields {
            self.index(field).store(value, Arc::clone(&item));
        }

        debug!(
            cache = %self.name,
            displaced = displaced.len(),
            records = self.len_unlocked(),
            "Upserted record"
        );

        item
    }

    /// Remove the stored record sharing `item`'s identity
    pub fn delete(&self, item: &T) -> bool {
        let id = item
            .field_map()
            .into_iter()
            .find(|(field, value)| *field == ID_INDEX && !value.is_empty());
        match id {
            Some((_, id)) => self.delete_by_index(ID_INDEX, &id),
            None => false,
        }
    }

    /// Locate a record through one index and remove it from all of them
    pub fn delete_by_index(&self, field: &str, value: &str) -> bool {
        if value.is_empty() {
            return false;
        }
        let _guard = self.lock.write();
        let Some(holder) = self.index(field).load(&value.to_string()) else {
            return false;
        };
        self.remove_entries(&holder);
        debug!(cache = %self.name, field, value, "Deleted record");
        true
    }

    pub fn get_by_index(&self, field: &str, value: &str) -> Option<Arc<T>> {
        if value.is_empty() {
            return None;
        }
        let _guard = self.lock.read();
        self.indexes
            .load(&field.to_string())
            .and_then(|index| index.load(&value.to_string()))
    }

    /// Visit each live record exactly once until `f` returns false
    pub fn range(&self, mut f: impl FnMut(&Arc<T>) -> bool) {
        let _guard = self.lock.read();
        if let Some(ids) = self.indexes.load(&ID_INDEX.to_string()) {
            ids.range(|_, item| f(item));
        }
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let _guard = self.lock.read();
        self.len_unlocked()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn len_unlocked(&self) -> usize {
        self.indexes
            .load(&ID_INDEX.to_string())
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    fn index(&self, field: &str) -> Arc<Index<T>> {
        self.indexes
            .load_or_store(field.to_string(), Arc::new(SlotMap::new()))
            .0
    }

    /// Drop every entry that still points at `holder`. Caller holds the write lock.
    fn remove_entries(&self, holder: &Arc<T>) {
        for (field, value) in non_empty_fields(holder.as_ref()) {
            self.index(field)
                .delete_if(&value, |current| Arc::ptr_eq(current, holder));
        }
    }
}

fn non_empty_fields<T: Indexed>(item: &T) -> FieldMap {
    item.field_map()
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .collect()
}
