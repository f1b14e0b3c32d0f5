//! Read-through cache with an injected loader and per-key invalidation.
//!
//! Entries live until explicitly invalidated; there is no TTL and no
//! eviction. Values are shared as `Arc<V>` so readers never hold the lock
//! while they work.

use anyhow::Result;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

/// Fetches a value on a cache miss. `Ok(None)` means "no data" and is not cached.
pub type Loader<K, V> = Box<dyn Fn(&K) -> Result<Option<V>> + Send + Sync>;

pub struct ReadThroughCache<K, V> {
    loader: Loader<K, V>,
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> ReadThroughCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&K) -> Result<Option<V>> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// A cache whose loader never finds anything; only primed or inserted
    /// values are served.
    #[must_use]
    pub fn unbacked() -> Self {
        Self::new(|_| Ok(None))
    }

    /// Returns the cached value, consulting the loader on a miss.
    pub fn get(&self, key: &K) -> Result<Option<Arc<V>>> {
        if let Some(hit) = self.peek(key) {
            return Ok(Some(hit));
        }

        match (self.loader)(key)? {
            Some(value) => Ok(Some(self.insert(key.clone(), value))),
            None => Ok(None),
        }
    }

    /// Cached value without touching the loader.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Returns the cached value or computes, stores and returns a new one.
    pub fn get_or_try_insert_with<E, F>(&self, key: K, compute: F) -> std::result::Result<Arc<V>, E>
    where
        F: FnOnce() -> std::result::Result<V, E>,
    {
        if let Some(hit) = self.peek(&key) {
            return Ok(hit);
        }
        let value = compute()?;
        Ok(self.insert(key, value))
    }

    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&value));
        value
    }

    /// Bulk insert, used to warm the cache at initialization.
    pub fn prime<I>(&self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in values {
            entries.insert(key, Arc::new(value));
        }
    }

    /// Mutates the entry in place, creating it from `default` when absent.
    /// Readers holding the previous `Arc` keep their snapshot.
    pub fn upsert<D, F>(&self, key: K, default: D, mutate: F)
    where
        V: Clone,
        D: FnOnce() -> V,
        F: FnOnce(&mut V),
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key).or_insert_with(|| Arc::new(default()));
        mutate(Arc::make_mut(entry));
    }

    /// Drops one key. Returns whether it was cached.
    pub fn invalidate(&self, key: &K) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Vec<(K, Arc<V>)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, value)| (key.clone(), Arc::clone(value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> std::fmt::Debug for ReadThroughCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .entries
            .read()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("ReadThroughCache").field("entries", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cache() -> (ReadThroughCache<String, usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = ReadThroughCache::new(move |key: &String| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(if key.is_empty() { None } else { Some(key.len()) })
        });
        (cache, calls)
    }

    #[test]
    fn test_loader_runs_once_per_key() {
        let (cache, calls) = counting_cache();
        assert_eq!(*cache.get(&"abc".to_string()).unwrap().unwrap(), 3);
        assert_eq!(*cache.get(&"abc".to_string()).unwrap().unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_misses_are_not_cached() {
        let (cache, calls) = counting_cache();
        assert!(cache.get(&String::new()).unwrap().is_none());
        assert!(cache.get(&String::new()).unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let (cache, calls) = counting_cache();
        cache.get(&"ab".to_string()).unwrap();
        assert!(cache.invalidate(&"ab".to_string()));
        cache.get(&"ab".to_string()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_upsert_keeps_old_snapshot() {
        let cache: ReadThroughCache<&str, Vec<u8>> = ReadThroughCache::unbacked();
        cache.insert("k", vec![1]);
        let before = cache.peek(&"k").unwrap();
        cache.upsert("k", Vec::new, |v| v.push(2));
        assert_eq!(*before, vec![1]);
        assert_eq!(*cache.peek(&"k").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_loader_error_propagates() {
        let cache: ReadThroughCache<u8, u8> =
            ReadThroughCache::new(|_| Err(anyhow::anyhow!("backend down")));
        assert!(cache.get(&1).is_err());
    }
}
