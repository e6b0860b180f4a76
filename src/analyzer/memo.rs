use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;

use crate::error::Result;

/// A concurrency-safe lookup cache that never evicts.
///
/// Keys are driver-level identifiers (relation oids, type oids) that only mean
/// something for one connection, so each analyzer owns its own memos.
#[derive(Debug)]
pub struct Memo<K: Eq + Hash, V> {
    entries: DashMap<K, V>,
}

impl<K: Eq + Hash, V: Clone> Default for Memo<K, V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V: Clone> Memo<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Returns the cached value for `key`, running `lookup` on a miss. Failed
    /// lookups are not cached.
    pub async fn get_or_try_insert<F, Fut>(&self, key: K, lookup: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = lookup().await?;
        self.entries.insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
