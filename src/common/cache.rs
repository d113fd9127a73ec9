//! In-memory cache for storing key-value pairs.
//!
//! Uses moka's high-performance concurrent cache implementation.

use moka::sync::Cache;

/// Thread-safe in-memory cache with configurable capacity.
///
/// Used for the engine's compiled plans (`MemCache<String, Arc<ExecutionPlan>>`); an
/// evicted plan is recompiled from the stored definition on the next lookup.
#[derive(Clone)]
pub struct MemCache<K, V> {
    entries: Cache<K, V>,
}

impl<K, V> MemCache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Allocate a new [`MemCache`].
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Cache::new(capacity as u64),
        }
    }

    /// Insert or replace an entry.
    pub fn set(
        &self,
        key: K,
        value: V,
    ) {
        self.entries.insert(key, value);
    }

    /// Get an entry through key `&K`.
    pub fn get(
        &self,
        key: &K,
    ) -> Option<V> {
        self.entries.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::MemCache;

    #[test]
    fn test_set_replaces() {
        let cache = MemCache::new(16);
        assert_eq!(cache.get(&"wf".to_string()), None);
        cache.set("wf".to_string(), 1);
        cache.set("wf".to_string(), 2);
        assert_eq!(cache.get(&"wf".to_string()), Some(2));
    }
}
