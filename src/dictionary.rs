use crate::config::DictionaryConfig;
use crate::error::{ConcurError, Result};
use crate::reclaim::{self, Hazard, UNIQUE_FAMILY};
use crate::split_list::{self, SplitOrderedList};
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::collections::hash_map::RandomState;

/// A lock-free hash map.
///
/// Per-key operations are linearizable. Values are handed out by clone,
/// since another thread may be reading the stored value at the same time.
///
/// # Examples
///
/// ```
/// use concur::ConcurrentDictionary;
///
/// let hits = ConcurrentDictionary::new();
///
/// hits.add_or_update("/", 1, |_, old| old + 1);
/// hits.add_or_update("/", 1, |_, old| old + 1);
///
/// assert_eq!(hits.get("/"), Ok(2));
/// ```
///
/// Replaced entries are reclaimed lazily and may outlive the map, so keys and
/// values must own their data:
///
/// ```compile_fail
/// use concur::ConcurrentDictionary;
///
/// let name = String::from("borrowed");
/// let names = ConcurrentDictionary::new();
///
/// names.set(1, name.as_str());
/// ```
pub struct ConcurrentDictionary<K, V, S = RandomState> {
    list: AtomicPtr<SplitOrderedList<K, V>>,
    hasher: S,
    config: DictionaryConfig,
    _marker: PhantomData<Box<SplitOrderedList<K, V>>>,
}

impl<K, V> ConcurrentDictionary<K, V, RandomState> {
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    pub fn with_config(config: DictionaryConfig) -> Result<Self> {
        Self::with_config_and_hasher(config, RandomState::new())
    }
}

impl<K, V, S> ConcurrentDictionary<K, V, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self::build(DictionaryConfig::default(), hasher)
    }

    pub fn with_config_and_hasher(config: DictionaryConfig, hasher: S) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, hasher))
    }

    fn build(config: DictionaryConfig, hasher: S) -> Self {
        Self {
            list: AtomicPtr::new(Self::fresh_list(&config)),
            hasher,
            config,
            _marker: PhantomData,
        }
    }

    fn fresh_list(config: &DictionaryConfig) -> *mut SplitOrderedList<K, V> {
        Box::into_raw(Box::new(SplitOrderedList::new(
            config.initial_buckets,
            config.max_load,
        )))
    }

    /// Runs `f` against the current list, which stays alive for the call even
    /// if a concurrent `clear` replaces it.
    fn with_list<R>(&self, f: impl FnOnce(&SplitOrderedList<K, V>) -> R) -> R {
        let mut hazard = reclaim::hazard();
        let list = reclaim::protect(&self.list, &mut hazard);

        f(unsafe { &*list })
    }

    pub fn len(&self) -> usize {
        self.with_list(|list| list.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }
}

impl<K, V, S> ConcurrentDictionary<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u32 {
        self.hasher.hash_one(key) as u32
    }

    /// Inserts `value` only if `key` is absent. Returns whether it was inserted.
    pub fn try_add(&self, key: K, value: V) -> bool {
        let hash = self.hash(&key);
        self.with_list(|list| list.insert(hash, key, value))
    }

    /// Stores `value` under `key`, replacing whatever was there.
    pub fn set(&self, key: K, value: V) {
        let hash = self.hash(&key);
        self.with_list(|list| list.upsert(hash, key, value))
    }

    /// Inserts `value` if `key` is absent, otherwise stores `update(&key, &current)`.
    ///
    /// Returns the value that ended up stored. `update` may run more than once
    /// when other threads write the same key concurrently.
    pub fn add_or_update<F>(&self, key: K, value: V, update: F) -> V
    where
        V: Clone,
        F: FnMut(&K, &V) -> V,
    {
        self.add_or_update_with(key, move |_| value, update)
    }

    /// Like [`add_or_update`](Self::add_or_update) with the inserted value
    /// computed from the key.
    pub fn add_or_update_with<I, U>(&self, key: K, insert: I, update: U) -> V
    where
        V: Clone,
        I: FnOnce(&K) -> V,
        U: FnMut(&K, &V) -> V,
    {
        let hash = self.hash(&key);
        self.with_list(|list| list.insert_or_update(hash, key, insert, update))
    }

    /// Returns the value stored under `key`, storing `value` first if absent.
    pub fn get_or_add(&self, key: K, value: V) -> V
    where
        V: Clone,
    {
        self.get_or_add_with(key, move |_| value)
    }

    /// Returns the value stored under `key`, storing `factory(&key)` first if absent.
    pub fn get_or_add_with<F>(&self, key: K, factory: F) -> V
    where
        V: Clone,
        F: FnOnce(&K) -> V,
    {
        let hash = self.hash(&key);
        self.with_list(|list| list.insert_or_get(hash, key, factory))
    }

    /// Indexer-style lookup.
    pub fn get<Q>(&self, key: &Q) -> Result<V>
    where
        V: Clone,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.try_get_value(key).ok_or(ConcurError::KeyNotFound)
    }

    pub fn try_get_value<Q>(&self, key: &Q) -> Option<V>
    where
        V: Clone,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.with_list(|list| list.find(hash, key))
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.with_list(|list| list.contains(hash, key))
    }

    /// Removes `key` and returns the value it held.
    pub fn try_remove<Q>(&self, key: &Q) -> Option<V>
    where
        V: Clone,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.with_list(|list| list.delete(hash, key))
    }

    /// Stores `value` under `key` only if the current value equals `comparison`.
    pub fn try_update<Q>(&self, key: &Q, value: V, comparison: &V) -> bool
    where
        V: PartialEq,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.with_list(|list| list.compare_exchange(hash, key, value, |current| current == comparison))
    }

    /// Drops every entry by swapping in an empty list.
    ///
    /// Operations and iterators already running finish against the old list.
    pub fn clear(&self) {
        let fresh = Self::fresh_list(&self.config);
        let old = self.list.swap(fresh, Ordering::SeqCst);

        log::debug!("cleared dictionary of {} entries", unsafe { (*old).len() });

        unsafe {
            reclaim::retire(old);
        }
    }

    /// Point-in-time copy of the keys.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
        V: Clone,
    {
        self.iter().map(|(key, _)| key).collect()
    }

    /// Point-in-time copy of the values.
    pub fn values(&self) -> Vec<V>
    where
        K: Clone,
        V: Clone,
    {
        self.iter().map(|(_, value)| value).collect()
    }

    /// Lazily walks the entries.
    ///
    /// Entries present for the whole walk are yielded exactly once. Entries
    /// added or removed meanwhile may or may not appear.
    pub fn iter(&self) -> Iter<'_, K, V>
    where
        K: Clone,
        V: Clone,
    {
        let mut hazard = reclaim::hazard();
        let list = reclaim::protect(&self.list, &mut hazard);

        Iter {
            inner: unsafe { &*list }.iter(),
            _hazard: hazard,
        }
    }
}

impl<K, V, S> Default for ConcurrentDictionary<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> core::fmt::Debug for ConcurrentDictionary<K, V, S>
where
    K: core::fmt::Debug + Clone + Hash + Eq + Send + Sync + 'static,
    V: core::fmt::Debug + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> FromIterator<(K, V)> for ConcurrentDictionary<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let dictionary = Self::with_hasher(S::default());
        for (key, value) in iter {
            dictionary.set(key, value);
        }
        dictionary
    }
}

impl<K, V, S> Drop for ConcurrentDictionary<K, V, S> {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(*self.list.get_mut()));
        }

        UNIQUE_FAMILY.eager_reclaim();
    }
}

/// Iterator over `(key, value)` clones, see [`ConcurrentDictionary::iter`].
pub struct Iter<'a, K, V> {
    inner: split_list::Iter<'a, K, V>,
    // Keeps the list alive across a concurrent `clear`; must drop after `inner`.
    _hazard: Hazard,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl<'a, K, V, S> IntoIterator for &'a ConcurrentDictionary<K, V, S>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::hash::Hasher;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct ConstantState;

    struct ConstantHasher;

    impl Hasher for ConstantHasher {
        fn finish(&self) -> u64 {
            42
        }

        fn write(&mut self, _: &[u8]) {}
    }

    impl BuildHasher for ConstantState {
        type Hasher = ConstantHasher;

        fn build_hasher(&self) -> ConstantHasher {
            ConstantHasher
        }
    }

    #[test]
    fn test_try_add_and_get() {
        let map = ConcurrentDictionary::new();

        assert!(map.try_add(1, "a"));
        assert!(!map.try_add(1, "b"));

        assert_eq!(map.get(&1), Ok("a"));
        assert_eq!(map.get(&2), Err(ConcurError::KeyNotFound));
        assert_eq!(map.try_get_value(&1), Some("a"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_set_overwrites() {
        let map = ConcurrentDictionary::new();

        map.set("k", 1);
        map.set("k", 2);

        assert_eq!(map.get("k"), Ok(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_add_or_update_twice() {
        let map = ConcurrentDictionary::new();

        assert_eq!(map.add_or_update("x", 1, |_, old| old + 1), 1);
        assert_eq!(map.add_or_update("x", 1, |_, old| old + 1), 2);
        assert_eq!(map.get("x"), Ok(2));
    }

    #[test]
    fn test_get_or_add_with_runs_factory_once() {
        let map = ConcurrentDictionary::new();
        let mut calls = 0;

        let v = map.get_or_add_with("k", |_| {
            calls += 1;
            7
        });
        assert_eq!(v, 7);

        let v = map.get_or_add_with("k", |_| {
            calls += 1;
            8
        });
        assert_eq!(v, 7);
        assert_eq!(calls, 1);

        assert_eq!(map.get_or_add("j", 3), 3);
        assert_eq!(map.get_or_add("j", 4), 3);
    }

    #[test]
    fn test_remove_and_update() {
        let map = ConcurrentDictionary::new();
        map.set(String::from("a"), 1);

        assert!(!map.try_update("a", 5, &2));
        assert!(map.try_update("a", 5, &1));
        assert_eq!(map.get("a"), Ok(5));

        assert_eq!(map.try_remove("a"), Some(5));
        assert_eq!(map.try_remove("a"), None);
        assert!(!map.contains_key("a"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_clear_leaves_running_iterator_alone() {
        let map: ConcurrentDictionary<u32, u32> = (0..100).map(|i| (i, i)).collect();

        let iter = map.iter();
        map.clear();

        assert!(map.is_empty());
        assert_eq!(map.try_get_value(&5), None);
        assert_eq!(iter.count(), 100);

        map.set(1, 1);
        assert_eq!(map.keys(), vec![1]);
    }

    #[test]
    fn test_keys_and_values() {
        let map: ConcurrentDictionary<u32, u32> = (0..10).map(|i| (i, i * 2)).collect();

        let keys: HashSet<u32> = map.keys().into_iter().collect();
        let values: HashSet<u32> = map.values().into_iter().collect();

        assert_eq!(keys, (0..10).collect());
        assert_eq!(values, (0..10).map(|i| i * 2).collect());

        let pairs: HashSet<(u32, u32)> = (&map).into_iter().collect();
        assert_eq!(pairs.len(), 10);
    }

    #[test]
    fn test_colliding_hasher() {
        let map = ConcurrentDictionary::with_hasher(ConstantState);

        for i in 0..64u32 {
            assert!(map.try_add(i, i + 1));
        }
        for i in (0..64u32).step_by(3) {
            assert_eq!(map.try_remove(&i), Some(i + 1));
        }
        for i in 0..64u32 {
            let expected = (i % 3 != 0).then_some(i + 1);
            assert_eq!(map.try_get_value(&i), expected);
        }
    }

    #[test]
    fn test_with_config_validates() {
        let bad = DictionaryConfig::new().with_initial_buckets(3);
        assert!(matches!(
            ConcurrentDictionary::<u32, u32>::with_config(bad),
            Err(ConcurError::InvalidArgument { .. })
        ));

        let small = DictionaryConfig::new().with_initial_buckets(1).with_max_load(1);
        let map = ConcurrentDictionary::with_config(small).unwrap();
        for i in 0..500u32 {
            map.set(i, i);
        }
        assert_eq!(map.len(), 500);
    }

    #[test]
    fn test_concurrent_counters() {
        let map = Arc::new(ConcurrentDictionary::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u32 {
                        map.add_or_update(i % 4, 1u32, |_, old| old + 1);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        let total: u32 = map.values().into_iter().sum();
        assert_eq!(total, 8000);
        assert_eq!(map.get(&0), Ok(2000));
    }

    #[test]
    fn test_replaced_values_reclaimed_after_drop() {
        let tracked = Arc::new(());

        {
            let map = ConcurrentDictionary::new();
            map.set(1, tracked.clone());
            map.set(1, tracked.clone());
            map.add_or_update(2, tracked.clone(), |_, old| old.clone());
            map.add_or_update(2, tracked.clone(), |_, old| old.clone());
            assert!(map.try_remove(&1).is_some());
            map.clear();
        }

        // Another thread's reclaim pass may hold part of the retired list.
        for _ in 0..1000 {
            if Arc::strong_count(&tracked) == 1 {
                break;
            }
            UNIQUE_FAMILY.eager_reclaim();
            std::thread::yield_now();
        }

        assert_eq!(Arc::strong_count(&tracked), 1);
    }
}
