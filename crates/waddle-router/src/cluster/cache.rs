//! Replicated map abstraction used for cluster-visible routing state.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;

/// A map whose contents every cluster member sees.
///
/// Single operations are atomic per key. Multi-step read-modify-write
/// sequences either go through [`Cache::compute`] or hold the key's lock
/// from [`Cache::key_lock`] for their duration.
pub trait Cache<K, V>: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &K) -> Option<V>;

    /// Insert, returning the previous value.
    fn put(&self, key: K, value: V) -> Option<V>;

    /// Insert unless present; returns the existing value if there was one.
    fn put_if_absent(&self, key: K, value: V) -> Option<V>;

    fn remove(&self, key: &K) -> Option<V>;

    /// Atomically replace the value for `key` with `f(current)`.
    ///
    /// Returning `None` removes the entry. The new value is returned.
    fn compute(&self, key: K, f: &mut dyn FnMut(Option<&V>) -> Option<V>) -> Option<V>;

    fn contains_key(&self, key: &K) -> bool;

    fn keys(&self) -> Vec<K>;

    fn entries(&self) -> Vec<(K, V)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock guarding multi-step updates of one key.
    ///
    /// Locks nobody holds any more are forgotten, so a key gets a fresh
    /// lock once all earlier holders are done with it.
    fn key_lock(&self, key: &K) -> Arc<Mutex<()>>;
}

/// A cache held in process memory.
///
/// Sharing one `Arc<LocalCache>` between several nodes in the same
/// process behaves like a replicated cache.
pub struct LocalCache<K, V> {
    name: String,
    map: DashMap<K, V>,
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K, V> LocalCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Create a cache ready to be shared as a trait object.
    pub fn shared(name: impl Into<String>) -> Arc<dyn Cache<K, V>> {
        Arc::new(Self::new(name))
    }

    /// Forget the lock of `key` unless someone holds it.
    fn prune_lock(&self, key: &K) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl<K, V> Cache<K, V> for LocalCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        match self.map.entry(key) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(value);
                None
            }
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        let removed = self.map.remove(key).map(|(_, value)| value);
        self.prune_lock(key);
        removed
    }

    fn compute(&self, key: K, f: &mut dyn FnMut(Option<&V>) -> Option<V>) -> Option<V> {
        match self.map.entry(key) {
            Entry::Occupied(mut entry) => match f(Some(entry.get())) {
                Some(value) => {
                    entry.insert(value.clone());
                    Some(value)
                }
                None => {
                    let key = entry.key().clone();
                    entry.remove();
                    self.prune_lock(&key);
                    None
                }
            },
            Entry::Vacant(entry) => {
                let value = f(None)?;
                entry.insert(value.clone());
                Some(value)
            }
        }
    }

    fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn keys(&self) -> Vec<K> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn key_lock(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}

impl<K, V> fmt::Debug for LocalCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCache")
            .field("name", &self.name)
            .field("len", &self.map.len())
            .field("locks", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_if_absent_keeps_first() {
        let cache: LocalCache<String, u32> = LocalCache::new("test");
        assert_eq!(cache.put_if_absent("a".into(), 1), None);
        assert_eq!(cache.put_if_absent("a".into(), 2), Some(1));
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_compute_appends_and_removes() {
        let cache: LocalCache<String, Vec<u32>> = LocalCache::new("lists");
        let push = |n: u32| {
            move |current: Option<&Vec<u32>>| {
                let mut list = current.cloned().unwrap_or_default();
                list.push(n);
                Some(list)
            }
        };

        cache.compute("k".into(), &mut push(1));
        cache.compute("k".into(), &mut push(2));
        assert_eq!(cache.get(&"k".to_string()), Some(vec![1, 2]));

        let removed = cache.compute("k".into(), &mut |_| None);
        assert_eq!(removed, None);
        assert!(!cache.contains_key(&"k".to_string()));
    }

    #[tokio::test]
    async fn test_key_lock_is_shared_per_key() {
        let cache: LocalCache<String, u32> = LocalCache::new("locks");
        let a = cache.key_lock(&"a".to_string());
        let a_again = cache.key_lock(&"a".to_string());
        let b = cache.key_lock(&"b".to_string());

        let _guard = a.lock().await;
        assert!(a_again.try_lock().is_err());
        assert!(b.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_locks_of_removed_keys_are_released() {
        let cache: LocalCache<u32, u32> = LocalCache::new("streams");
        for key in 0..1000 {
            let lock = cache.key_lock(&key);
            let _guard = lock.lock().await;
            cache.put(key, key);
            cache.remove(&key);
        }
        assert!(cache.is_empty());
        assert!(cache.locks.len() <= 1);

        let lock = cache.key_lock(&7);
        cache.put(7, 7);
        drop(lock);
        cache.compute(7, &mut |_| None);
        assert!(cache.locks.is_empty());
    }

    #[test]
    fn test_debug_reports_size() {
        let cache: LocalCache<String, u32> = LocalCache::new("Routing Users Cache");
        cache.put("a".into(), 1);
        let rendered = format!("{cache:?}");
        assert!(rendered.contains("Routing Users Cache"));
        assert!(rendered.contains("len: 1"));
    }

    #[tokio::test]
    async fn test_held_lock_survives_removal_of_its_key() {
        let cache: LocalCache<u32, u32> = LocalCache::new("streams");
        let lock = cache.key_lock(&1);
        let _guard = lock.lock().await;
        cache.put(1, 1);
        cache.remove(&1);

        assert!(cache.key_lock(&1).try_lock().is_err());
    }
}
