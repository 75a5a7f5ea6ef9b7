//! An unordered collection built from one work-stealing deque per thread.
//!
//! A thread pushes and pops at the bottom of its own deque. When that deque
//! runs dry it steals from the top of someone else's, first from a recently
//! active thread named by the hint register, then from every deque listed in
//! `staging`.

use crate::config::BagConfig;
use crate::deque::{CyclicDeque, Pop};
use crate::dictionary::{self, ConcurrentDictionary};
use crate::error::{ConcurError, Result};
use core::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;
use std::sync::Arc;

static NEXT_AFFINITY: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    static AFFINITY: usize = NEXT_AFFINITY.fetch_add(1, Ordering::Relaxed);
}

/// Key of the calling thread's deque: stable for the thread's lifetime and
/// never handed to another thread.
fn affinity() -> usize {
    AFFINITY.with(|key| *key)
}

const HINT_BITS: u32 = 4;
const HINT_MASK: u32 = (1 << HINT_BITS) - 1;

type Deques<T> = ConcurrentDictionary<usize, Arc<CyclicDeque<T>>>;

/// A lock-free multi-producer multi-consumer bag.
///
/// Items come back in no particular order. A thread that only takes what it
/// added itself sees them LIFO, but that is not part of the contract.
///
/// `len` and `is_empty` read a counter that trails the deques, so they are
/// exact only while no other thread is adding or taking.
///
/// # Examples
///
/// ```
/// use concur::ConcurrentBag;
///
/// let bag = ConcurrentBag::new();
/// bag.add(1);
/// bag.add(2);
///
/// assert_eq!(bag.len(), 2);
/// assert!(bag.try_take().is_some());
/// ```
pub struct ConcurrentBag<T> {
    /// Every deque ever created, by affinity key.
    container: Deques<T>,
    /// Deques that may hold something worth stealing.
    staging: Deques<T>,
    count: CachePadded<AtomicUsize>,
    hints: CachePadded<AtomicU32>,
    config: BagConfig,
}

impl<T> ConcurrentBag<T> {
    pub fn new() -> Self {
        Self::build(BagConfig::default())
    }

    pub fn with_config(config: BagConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: BagConfig) -> Self {
        ConcurrentBag {
            container: ConcurrentDictionary::new(),
            staging: ConcurrentDictionary::new(),
            count: CachePadded::new(AtomicUsize::new(0)),
            hints: CachePadded::new(AtomicU32::new(0)),
            config,
        }
    }

    pub fn len(&self) -> usize {
        let len = self.count.load(Ordering::SeqCst);
        if len > isize::MAX as usize {
            0
        } else {
            len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records `key` as recently active. Keys above 15 don't fit a nibble and
    /// are skipped; a lost CAS drops the hint.
    fn add_hint(&self, key: usize) {
        if key == 0 || key > HINT_MASK as usize {
            return;
        }

        let old = self.hints.load(Ordering::Relaxed);
        let new = (old << HINT_BITS) | key as u32;

        let _ = self
            .hints
            .compare_exchange(old, new, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Pops the most recent hint with a single CAS attempt.
    fn try_get_hint(&self) -> Option<usize> {
        let old = self.hints.load(Ordering::Relaxed);
        let hint = old & HINT_MASK;

        if hint == 0 {
            return None;
        }

        self.hints
            .compare_exchange(old, old >> HINT_BITS, Ordering::Relaxed, Ordering::Relaxed)
            .ok()
            .map(|_| hint as usize)
    }

    fn peek_hint(&self) -> Option<usize> {
        match self.hints.load(Ordering::Relaxed) & HINT_MASK {
            0 => None,
            hint => Some(hint as usize),
        }
    }
}

impl<T> ConcurrentBag<T>
where
    T: Send + Sync + 'static,
{
    pub fn add(&self, item: T) {
        let key = affinity();
        let deque = self.container.get_or_add_with(key, |key| {
            log::trace!("bag created a deque for affinity key {}", key);
            Arc::new(CyclicDeque::new(self.config.deque_capacity))
        });

        unsafe {
            deque.push_bottom(item);
        }

        // Pairs with the emptiness re-check in `retire_if_empty`.
        fence(Ordering::SeqCst);

        if !self.staging.contains_key(&key) {
            self.staging.try_add(key, deque);
        }

        self.add_hint(key);
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn try_take(&self) -> Option<T> {
        if self.count.load(Ordering::SeqCst) == 0 {
            return None;
        }

        let key = affinity();

        if let Some(deque) = self.container.try_get_value(&key) {
            if let Pop::Succeed(item) = unsafe { deque.pop_bottom() } {
                self.taken(key, &deque);
                return Some(item);
            }
        }

        self.steal(key)
    }

    fn steal(&self, own: usize) -> Option<T> {
        if let Some(hint) = self.try_get_hint().filter(|hint| *hint != own) {
            if let Some(deque) = self.staging.try_get_value(&hint) {
                if let Pop::Succeed(item) = deque.pop_top() {
                    self.taken(hint, &deque);
                    return Some(item);
                }
            }
        }

        for (key, deque) in self.staging.iter() {
            if key == own {
                continue;
            }

            loop {
                match deque.pop_top() {
                    Pop::Succeed(item) => {
                        self.taken(key, &deque);
                        return Some(item);
                    }
                    Pop::Abort => continue,
                    Pop::Empty => break,
                }
            }
        }

        None
    }

    fn taken(&self, key: usize, deque: &CyclicDeque<T>) {
        self.count.fetch_sub(1, Ordering::SeqCst);

        if deque.is_empty() {
            self.retire_if_empty(key);
        }
    }

    /// Drops an empty deque from `staging`, putting it back if an add raced in.
    fn retire_if_empty(&self, key: usize) {
        if let Some(deque) = self.staging.try_remove(&key) {
            if !deque.is_empty() {
                self.staging.try_add(key, deque);
            }
        }
    }

    /// Clones some item without removing it.
    ///
    /// Best effort: each candidate deque is peeked once, so this can miss
    /// items while other threads are taking.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        if self.count.load(Ordering::SeqCst) == 0 {
            return None;
        }

        let own = affinity();

        if let Some(deque) = self.container.try_get_value(&own) {
            if let Some(item) = unsafe { deque.peek_bottom() } {
                return Some(item);
            }
        }

        if let Some(hint) = self.peek_hint().filter(|hint| *hint != own) {
            if let Some(item) = self
                .staging
                .try_get_value(&hint)
                .and_then(|deque| deque.peek_top())
            {
                return Some(item);
            }
        }

        self.staging
            .iter()
            .filter(|(key, _)| *key != own)
            .find_map(|(_, deque)| deque.peek_top())
    }

    /// Lazily walks every deque's current contents.
    ///
    /// Not a snapshot: under concurrent adds and takes the walk can repeat or
    /// miss items.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        Iter {
            deques: self.container.iter(),
            current: None,
            index: 0,
        }
    }

    /// Clones up to `len()` items, as counted when the call starts.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let len = self.len();
        let mut items = Vec::with_capacity(len);
        items.extend(self.iter().take(len));
        items
    }

    /// Clones up to `len()` items into the front of `dest`, returning how many
    /// were written.
    pub fn copy_to(&self, dest: &mut [T]) -> Result<usize>
    where
        T: Clone,
    {
        let len = self.len();
        if dest.len() < len {
            return Err(ConcurError::capacity_exceeded(len, dest.len()));
        }

        let mut copied = 0;
        for (slot, item) in dest.iter_mut().zip(self.iter().take(len)) {
            *slot = item;
            copied += 1;
        }

        Ok(copied)
    }
}

impl<T> Default for ConcurrentBag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for ConcurrentBag<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConcurrentBag")
            .field("len", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

impl<T> FromIterator<T> for ConcurrentBag<T>
where
    T: Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let bag = Self::new();
        for item in iter {
            bag.add(item);
        }
        bag
    }
}

/// Iterator returned by [`ConcurrentBag::iter`].
pub struct Iter<'a, T> {
    deques: dictionary::Iter<'a, usize, Arc<CyclicDeque<T>>>,
    current: Option<Arc<CyclicDeque<T>>>,
    index: isize,
}

impl<'a, T> Iterator for Iter<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if let Some(deque) = &self.current {
                let (top, bottom) = deque.bounds();
                self.index = self.index.max(top);

                while self.index < bottom {
                    let index = self.index;
                    self.index += 1;

                    if let Some(item) = deque.peek_at(index) {
                        return Some(item);
                    }
                }
            }

            let (_, deque) = self.deques.next()?;
            self.index = deque.bounds().0;
            self.current = Some(deque);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn test_lifo_on_own_items() {
        let bag = ConcurrentBag::new();

        bag.add(1);
        bag.add(2);

        assert_eq!(bag.try_take(), Some(2));
        assert_eq!(bag.try_take(), Some(1));
        assert_eq!(bag.try_take(), None);
        assert!(bag.is_empty());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let bag = ConcurrentBag::new();

        assert_eq!(bag.try_peek(), None);

        bag.add("a");
        assert_eq!(bag.try_peek(), Some("a"));
        assert_eq!(bag.len(), 1);
        assert_eq!(bag.try_take(), Some("a"));
    }

    #[test]
    fn test_steals_from_finished_thread() {
        let bag = Arc::new(ConcurrentBag::new());

        {
            let bag = bag.clone();
            std::thread::spawn(move || (0..100).for_each(|i| bag.add(i)))
                .join()
                .unwrap();
        }

        assert_eq!(bag.len(), 100);
        assert!(bag.try_peek().is_some());

        let mut taken: Vec<i32> = std::iter::from_fn(|| bag.try_take()).collect();
        taken.sort_unstable();

        assert_eq!(taken, (0..100).collect::<Vec<_>>());
        assert!(bag.is_empty());
    }

    #[test]
    fn test_hint_register() {
        let bag = ConcurrentBag::<u8>::new();

        bag.add_hint(3);
        bag.add_hint(5);
        bag.add_hint(16);

        assert_eq!(bag.peek_hint(), Some(5));
        assert_eq!(bag.try_get_hint(), Some(5));
        assert_eq!(bag.try_get_hint(), Some(3));
        assert_eq!(bag.try_get_hint(), None);
    }

    #[test]
    fn test_conservation() {
        let bag = Arc::new(ConcurrentBag::new());

        let threads: Vec<_> = (0..8usize)
            .map(|t| {
                let bag = bag.clone();
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut taken = Vec::new();

                    for i in 0..500 {
                        bag.add(t * 500 + i);

                        if rng.gen_bool(0.5) {
                            taken.extend(bag.try_take());
                        }
                    }

                    taken
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            for item in thread.join().unwrap() {
                assert!(seen.insert(item), "duplicate item {item}");
            }
        }

        assert_eq!(bag.len(), 4000 - seen.len());

        while let Some(item) = bag.try_take() {
            assert!(seen.insert(item), "duplicate item {item}");
        }

        assert_eq!(seen.len(), 4000);
        assert!(bag.is_empty());
    }

    #[test]
    fn test_iter_and_copy_to() {
        let bag: ConcurrentBag<u32> = (0..10).collect();

        let mut items = bag.to_vec();
        items.sort_unstable();
        assert_eq!(items, (0..10).collect::<Vec<_>>());
        assert_eq!(bag.iter().count(), 10);

        let mut short = [0u32; 4];
        assert_eq!(
            bag.copy_to(&mut short),
            Err(ConcurError::capacity_exceeded(10, 4))
        );
        assert_eq!(short, [0; 4]);

        let mut dest = [0u32; 12];
        assert_eq!(bag.copy_to(&mut dest), Ok(10));
        assert_eq!(dest[10..], [0, 0]);
    }

    #[test]
    fn test_with_config() {
        assert!(ConcurrentBag::<u8>::with_config(BagConfig::new().with_deque_capacity(3)).is_err());

        let bag = ConcurrentBag::with_config(BagConfig::new().with_deque_capacity(2)).unwrap();
        (0..50).for_each(|i| bag.add(i));
        assert_eq!(bag.len(), 50);
    }

    #[test]
    fn test_drop_releases_items() {
        let tracked = Arc::new(());

        {
            let bag = ConcurrentBag::new();
            (0..10).for_each(|_| bag.add(tracked.clone()));
            bag.try_take();
            assert_eq!(Arc::strong_count(&tracked), 10);
        }

        assert_eq!(Arc::strong_count(&tracked), 1);
    }

    #[test]
    fn test_panicking_clone_does_not_block_take() {
        struct Fragile(u32);

        impl Clone for Fragile {
            fn clone(&self) -> Self {
                panic!("clone of {} failed", self.0)
            }
        }

        let bag = ConcurrentBag::new();
        bag.add(Fragile(3));

        let peeked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| bag.try_peek()));
        assert!(peeked.is_err());

        assert_eq!(bag.try_take().map(|item| item.0), Some(3));
        assert!(bag.is_empty());
    }
}
