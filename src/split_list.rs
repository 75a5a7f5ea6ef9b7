//! A lock-free split-ordered list (Shalev & Shavit).
//!
//! All entries live in one Harris–Michael linked list sorted by *split key*,
//! the bit-reversed hash. A bucket is a pointer to a sentinel node inside
//! that list, so doubling the bucket count never moves an entry: new buckets
//! are initialized lazily by splicing a sentinel after their parent's.
//!
//! - regular split key: `reverse_bits(hash | 0x8000_0000)` (lowest bit set)
//! - sentinel split key: `reverse_bits(bucket)` (lowest bit clear)
//!
//! Removal first swaps an entry's value pointer to null (the linearization
//! point), then tags the node's `next` link and unlinks it. Unlinked nodes,
//! replaced values, and removed values go to the hazard-pointer domain.

use crate::reclaim::{self, Hazard};
use crate::MaybeTagged;
use core::borrow::Borrow;
use core::marker::PhantomData;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const SEGMENT_SHIFT: usize = 10;
const SEGMENT_LEN: usize = 1 << SEGMENT_SHIFT;
const SEGMENT_COUNT: usize = 1 << 10;

/// Upper bound on the bucket count.
pub(crate) const MAX_BUCKETS: usize = SEGMENT_LEN * SEGMENT_COUNT;

const REGULAR_BIT: u32 = 0x8000_0000;

fn regular_key(hash: u32) -> u32 {
    (hash | REGULAR_BIT).reverse_bits()
}

fn sentinel_key(bucket: usize) -> u32 {
    (bucket as u32).reverse_bits()
}

/// `bucket` with its highest set bit cleared.
fn parent_bucket(bucket: usize) -> usize {
    if bucket == 0 {
        return 0;
    }
    bucket & !(1 << (usize::BITS - 1 - bucket.leading_zeros()))
}

struct Node<K, V> {
    split_key: u32,
    /// `None` for bucket sentinels.
    key: Option<K>,
    /// Null while a fresh node is being prepared and once the entry is removed.
    value: AtomicPtr<V>,
    next: MaybeTagged<Node<K, V>>,
    _value: PhantomData<Box<V>>,
}

impl<K, V> Node<K, V> {
    fn sentinel(bucket: usize) -> *mut Self {
        Box::into_raw(Box::new(Node {
            split_key: sentinel_key(bucket),
            key: None,
            value: AtomicPtr::new(null_mut()),
            next: MaybeTagged::new(null_mut()),
            _value: PhantomData,
        }))
    }

    fn regular(hash: u32, key: K, value: *mut V) -> *mut Self {
        Box::into_raw(Box::new(Node {
            split_key: regular_key(hash),
            key: Some(key),
            value: AtomicPtr::new(value),
            next: MaybeTagged::new(null_mut()),
            _value: PhantomData,
        }))
    }

    unsafe fn free(raw: *mut Self) {
        drop(Box::from_raw(raw));
    }

    /// # Safety
    /// Must only be called on regular nodes.
    unsafe fn key_ref(&self) -> &K {
        match &self.key {
            Some(key) => key,
            None => core::hint::unreachable_unchecked(),
        }
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        let value = *self.value.get_mut();
        if !value.is_null() {
            unsafe {
                drop(Box::from_raw(value));
            }
        }
    }
}

/// A regular node that is not reachable from the list yet.
///
/// Dropping it frees the node, so a panicking key comparison or user closure
/// cannot leak it.
struct Pending<K, V> {
    node: *mut Node<K, V>,
}

impl<K, V> Pending<K, V> {
    fn new(hash: u32, key: K, value: *mut V) -> Self {
        Pending {
            node: Node::regular(hash, key, value),
        }
    }

    /// Hands the node over to the list once it is linked.
    fn publish(self) {
        core::mem::forget(self);
    }
}

impl<K, V> Drop for Pending<K, V> {
    fn drop(&mut self) {
        unsafe {
            Node::free(self.node);
        }
    }
}

struct Segment<K, V> {
    buckets: Box<[AtomicPtr<Node<K, V>>]>,
}

impl<K, V> Segment<K, V> {
    fn new() -> Self {
        Segment {
            buckets: (0..SEGMENT_LEN).map(|_| AtomicPtr::new(null_mut())).collect(),
        }
    }
}

/// The hazard pointers one traversal needs.
pub(crate) struct Guards {
    prev: Hazard,
    cur: Hazard,
    value: Hazard,
}

impl Guards {
    pub(crate) fn new() -> Self {
        Guards {
            prev: reclaim::hazard(),
            cur: reclaim::hazard(),
            value: reclaim::hazard(),
        }
    }
}

/// Where a search ended: `prev` is the link that pointed at `cur` when it
/// was last validated.
struct Position<K, V> {
    prev: *const MaybeTagged<Node<K, V>>,
    cur: *mut Node<K, V>,
    found: bool,
}

pub(crate) struct SplitOrderedList<K, V> {
    segments: Box<[AtomicPtr<Segment<K, V>>]>,
    size: AtomicUsize,
    count: AtomicUsize,
    max_load: usize,
    _marker: PhantomData<Box<Node<K, V>>>,
}

impl<K, V> SplitOrderedList<K, V> {
    pub(crate) fn new(initial_buckets: usize, max_load: usize) -> Self {
        let list = SplitOrderedList {
            segments: (0..SEGMENT_COUNT).map(|_| AtomicPtr::new(null_mut())).collect(),
            size: AtomicUsize::new(initial_buckets.clamp(1, MAX_BUCKETS).next_power_of_two()),
            count: AtomicUsize::new(0),
            max_load: max_load.max(1),
            _marker: PhantomData,
        };

        list.bucket_slot(0)
            .store(Node::sentinel(0), Ordering::SeqCst);

        list
    }

    pub(crate) fn len(&self) -> usize {
        let len = self.count.load(Ordering::Relaxed);
        if len > isize::MAX as usize {
            0
        } else {
            len
        }
    }

    pub(crate) fn buckets(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn bucket_slot(&self, bucket: usize) -> &AtomicPtr<Node<K, V>> {
        let segment = &self.segments[bucket >> SEGMENT_SHIFT];
        let mut ptr = segment.load(Ordering::Acquire);

        if ptr.is_null() {
            let fresh = Box::into_raw(Box::new(Segment::new()));
            match segment.compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    log::trace!("allocated bucket segment {}", bucket >> SEGMENT_SHIFT);
                    ptr = fresh;
                }
                Err(now) => {
                    unsafe {
                        drop(Box::from_raw(fresh));
                    }
                    ptr = now;
                }
            }
        }

        unsafe { &(*ptr).buckets[bucket & (SEGMENT_LEN - 1)] }
    }

    fn head(&self) -> *mut Node<K, V> {
        self.bucket_slot(0).load(Ordering::SeqCst)
    }
}

impl<K, V> SplitOrderedList<K, V>
where
    K: Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn bucket_for(&self, hash: u32, guards: &mut Guards) -> *mut Node<K, V> {
        let size = self.size.load(Ordering::Acquire);
        self.sentinel(hash as usize & (size - 1), guards)
    }

    fn sentinel(&self, bucket: usize, guards: &mut Guards) -> *mut Node<K, V> {
        let slot = self.bucket_slot(bucket);
        let ptr = slot.load(Ordering::Acquire);
        if !ptr.is_null() {
            return ptr;
        }

        self.initialize_bucket(bucket, slot, guards)
    }

    fn initialize_bucket(
        &self,
        bucket: usize,
        slot: &AtomicPtr<Node<K, V>>,
        guards: &mut Guards,
    ) -> *mut Node<K, V> {
        let parent = self.sentinel(parent_bucket(bucket), guards);
        let split_key = sentinel_key(bucket);
        let node = Node::sentinel(bucket);

        let sentinel = loop {
            let pos = unsafe { self.search::<K>(parent, split_key, None, guards) };

            if pos.found {
                unsafe {
                    Node::free(node);
                }
                break pos.cur;
            }

            if unsafe { self.link_at(&pos, node) } {
                break node;
            }
        };

        // Losing this race means another thread published the same sentinel.
        let _ = slot.compare_exchange(null_mut(), sentinel, Ordering::SeqCst, Ordering::SeqCst);

        log::trace!("initialized bucket {}", bucket);

        sentinel
    }

    /// Searches from the sentinel `start` for `split_key` (and `key` for
    /// regular entries), unlinking tagged nodes on the way.
    ///
    /// On return `cur` is protected by `guards.cur`.
    ///
    /// # Safety
    /// `start` must be a sentinel of this list.
    unsafe fn search<Q>(
        &self,
        start: *mut Node<K, V>,
        split_key: u32,
        key: Option<&Q>,
        guards: &mut Guards,
    ) -> Position<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        'retry: loop {
            let mut prev: *const MaybeTagged<Node<K, V>> = &(*start).next;
            let mut cur = (*prev).load_ptr();

            loop {
                if cur.is_null() {
                    return Position {
                        prev,
                        cur,
                        found: false,
                    };
                }

                guards.cur.protect_raw(cur);
                if (*prev).load() != (cur, false) {
                    continue 'retry;
                }

                let node = &*cur;
                let (next, tagged) = node.next.load();

                if tagged {
                    if (*prev)
                        .compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        continue 'retry;
                    }

                    reclaim::retire(cur);
                    cur = next;
                    continue;
                }

                if node.split_key > split_key {
                    return Position {
                        prev,
                        cur,
                        found: false,
                    };
                }

                if node.split_key == split_key {
                    let matched = match (key, &node.key) {
                        (None, None) => true,
                        (Some(key), Some(node_key)) => Borrow::<Q>::borrow(node_key) == key,
                        _ => false,
                    };

                    if matched {
                        if key.is_some() && node.value.load(Ordering::SeqCst).is_null() {
                            // Removed but not tagged yet; finish the job.
                            node.next.tag();
                            continue 'retry;
                        }

                        return Position {
                            prev,
                            cur,
                            found: true,
                        };
                    }
                }

                prev = &node.next;
                core::mem::swap(&mut guards.prev, &mut guards.cur);
                cur = next;
            }
        }
    }

    /// Regular-entry search from a bucket sentinel.
    ///
    /// # Safety
    /// `bucket` must be a sentinel of this list covering `hash`.
    unsafe fn find_entry<Q>(
        &self,
        key: Option<&Q>,
        bucket: *mut Node<K, V>,
        hash: u32,
        guards: &mut Guards,
    ) -> Position<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.search(bucket, regular_key(hash), key, guards)
    }

    /// Splices `node` in at `pos`. Returns `false` if the position went stale.
    ///
    /// # Safety
    /// `node` must be private to the caller and `pos` fresh from `search`.
    unsafe fn link_at(&self, pos: &Position<K, V>, node: *mut Node<K, V>) -> bool {
        (*node).next.store_ptr(pos.cur);

        (*pos.prev)
            .compare_exchange(pos.cur, node, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Counts a freshly linked entry and doubles the bucket count when the
    /// load factor is exceeded.
    fn linked(&self) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        let size = self.size.load(Ordering::Relaxed);

        if count / size > self.max_load
            && size < MAX_BUCKETS
            && self
                .size
                .compare_exchange(size, size * 2, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            log::debug!("split-ordered list grew to {} buckets", size * 2);
        }
    }

    /// Inserts only if `key` is absent.
    pub(crate) fn insert(&self, hash: u32, key: K, value: V) -> bool {
        let mut guards = Guards::new();
        let bucket = self.bucket_for(hash, &mut guards);
        let pending = Pending::new(hash, key, Box::into_raw(Box::new(value)));
        let node = pending.node;

        loop {
            let pos = unsafe { self.find_entry((*node).key.as_ref(), bucket, hash, &mut guards) };

            if pos.found {
                return false;
            }

            if unsafe { self.link_at(&pos, node) } {
                pending.publish();
                self.linked();
                return true;
            }
        }
    }

    /// Inserts `value`, replacing the current value if `key` is present.
    pub(crate) fn upsert(&self, hash: u32, key: K, value: V) {
        let mut guards = Guards::new();
        let bucket = self.bucket_for(hash, &mut guards);
        let pending = Pending::new(hash, key, Box::into_raw(Box::new(value)));
        let node = pending.node;

        loop {
            let pos = unsafe { self.find_entry((*node).key.as_ref(), bucket, hash, &mut guards) };

            if !pos.found {
                if unsafe { self.link_at(&pos, node) } {
                    pending.publish();
                    self.linked();
                    return;
                }
                continue;
            }

            let existing = unsafe { &*pos.cur };
            let old = reclaim::protect(&existing.value, &mut guards.value);
            if old.is_null() {
                continue;
            }

            let new = unsafe { (*node).value.load(Ordering::Relaxed) };
            if existing
                .value
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                unsafe {
                    (*node).value.store(null_mut(), Ordering::Relaxed);
                    reclaim::retire(old);
                }
                return;
            }
        }
    }

    /// Inserts `insert(&key)` if absent, otherwise replaces the value with
    /// `update(&key, &current)`. Returns the value that ended up stored.
    ///
    /// `insert` runs at most once; `update` reruns whenever its CAS loses.
    pub(crate) fn insert_or_update<I, U>(&self, hash: u32, key: K, insert: I, mut update: U) -> V
    where
        V: Clone,
        I: FnOnce(&K) -> V,
        U: FnMut(&K, &V) -> V,
    {
        let mut guards = Guards::new();
        let bucket = self.bucket_for(hash, &mut guards);
        let pending = Pending::new(hash, key, null_mut());
        let node = pending.node;
        let mut insert = Some(insert);

        loop {
            let key = unsafe { (*node).key.as_ref() };
            let pos = unsafe { self.find_entry(key, bucket, hash, &mut guards) };

            if pos.found {
                let existing = unsafe { &*pos.cur };
                let old = reclaim::protect(&existing.value, &mut guards.value);
                if old.is_null() {
                    continue;
                }

                let key = unsafe { (*node).key_ref() };
                let value = update(key, unsafe { &*old });
                let result = value.clone();
                let new = Box::into_raw(Box::new(value));

                if existing
                    .value
                    .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    unsafe {
                        reclaim::retire(old);
                    }
                    return result;
                }

                unsafe {
                    drop(Box::from_raw(new));
                }
                continue;
            }

            let value = unsafe { self.fill(node, &mut insert, &mut guards) };

            if unsafe { self.link_at(&pos, node) } {
                pending.publish();
                self.linked();
                return unsafe { (*value).clone() };
            }
        }
    }

    /// Returns the current value for `key`, inserting `insert(&key)` first if absent.
    pub(crate) fn insert_or_get<I>(&self, hash: u32, key: K, insert: I) -> V
    where
        V: Clone,
        I: FnOnce(&K) -> V,
    {
        let mut guards = Guards::new();
        let bucket = self.bucket_for(hash, &mut guards);
        let pending = Pending::new(hash, key, null_mut());
        let node = pending.node;
        let mut insert = Some(insert);

        loop {
            let key = unsafe { (*node).key.as_ref() };
            let pos = unsafe { self.find_entry(key, bucket, hash, &mut guards) };

            if pos.found {
                let existing = unsafe { &*pos.cur };
                let current = reclaim::protect(&existing.value, &mut guards.value);
                if current.is_null() {
                    continue;
                }

                return unsafe { (*current).clone() };
            }

            let value = unsafe { self.fill(node, &mut insert, &mut guards) };

            if unsafe { self.link_at(&pos, node) } {
                pending.publish();
                self.linked();
                return unsafe { (*value).clone() };
            }
        }
    }

    /// Gives a pending node its value (once) and protects it, so it can still
    /// be read after the node is published.
    ///
    /// # Safety
    /// `node` must be a pending node private to the caller.
    unsafe fn fill<I>(&self, node: *mut Node<K, V>, insert: &mut Option<I>, guards: &mut Guards) -> *mut V
    where
        I: FnOnce(&K) -> V,
    {
        let node = &*node;
        let mut value = node.value.load(Ordering::Relaxed);

        if value.is_null() {
            if let Some(insert) = insert.take() {
                value = Box::into_raw(Box::new(insert(node.key_ref())));
                node.value.store(value, Ordering::Relaxed);
            }
        }

        guards.value.protect_raw(value);
        value
    }

    pub(crate) fn find<Q>(&self, hash: u32, key: &Q) -> Option<V>
    where
        V: Clone,
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut guards = Guards::new();
        let bucket = self.bucket_for(hash, &mut guards);
        let pos = unsafe { self.find_entry(Some(key), bucket, hash, &mut guards) };

        if !pos.found {
            return None;
        }

        let node = unsafe { &*pos.cur };
        let value = reclaim::protect(&node.value, &mut guards.value);
        if value.is_null() {
            return None;
        }

        Some(unsafe { (*value).clone() })
    }

    pub(crate) fn contains<Q>(&self, hash: u32, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut guards = Guards::new();
        let bucket = self.bucket_for(hash, &mut guards);
        let pos = unsafe { self.find_entry(Some(key), bucket, hash, &mut guards) };

        pos.found && unsafe { !(*pos.cur).value.load(Ordering::SeqCst).is_null() }
    }

    /// Removes `key`, returning the value it held.
    pub(crate) fn delete<Q>(&self, hash: u32, key: &Q) -> Option<V>
    where
        V: Clone,
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut guards = Guards::new();
        let bucket = self.bucket_for(hash, &mut guards);

        loop {
            let pos = unsafe { self.find_entry(Some(key), bucket, hash, &mut guards) };
            if !pos.found {
                return None;
            }

            let node = unsafe { &*pos.cur };
            let old = reclaim::protect(&node.value, &mut guards.value);
            if old.is_null() {
                continue;
            }

            if node
                .value
                .compare_exchange(old, null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let value = unsafe { (*old).clone() };

                unsafe {
                    reclaim::retire(old);
                }

                node.next.tag();
                self.count.fetch_sub(1, Ordering::Relaxed);

                // Unlinks the tagged node on the way past it.
                unsafe {
                    self.find_entry(Some(key), bucket, hash, &mut guards);
                }

                return Some(value);
            }
        }
    }

    /// Replaces the value of `key` with `new` if `predicate` accepts the
    /// current value.
    pub(crate) fn compare_exchange<Q, P>(&self, hash: u32, key: &Q, new: V, predicate: P) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        P: Fn(&V) -> bool,
    {
        let mut guards = Guards::new();
        let bucket = self.bucket_for(hash, &mut guards);
        let new = Box::into_raw(Box::new(new));

        loop {
            let pos = unsafe { self.find_entry(Some(key), bucket, hash, &mut guards) };
            if !pos.found {
                break;
            }

            let node = unsafe { &*pos.cur };
            let old = reclaim::protect(&node.value, &mut guards.value);
            if old.is_null() {
                continue;
            }

            if !predicate(unsafe { &*old }) {
                break;
            }

            if node
                .value
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                unsafe {
                    reclaim::retire(old);
                }
                return true;
            }
        }

        unsafe {
            drop(Box::from_raw(new));
        }
        false
    }

    pub(crate) fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            list: self,
            guards: Guards::new(),
            cur: self.head(),
            last: None,
            run: Vec::new(),
        }
    }
}

impl<K, V> Drop for SplitOrderedList<K, V> {
    fn drop(&mut self) {
        let mut curr = self.head();

        unsafe {
            while !curr.is_null() {
                let next = (*curr).next.load_ptr();
                Node::free(curr);
                curr = next;
            }
        }

        for segment in self.segments.iter_mut() {
            let segment = *segment.get_mut();
            if !segment.is_null() {
                unsafe {
                    drop(Box::from_raw(segment));
                }
            }
        }
    }
}

impl<K, V> core::fmt::Debug for SplitOrderedList<K, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SplitOrderedList")
            .field("len", &self.len())
            .field("buckets", &self.buckets())
            .finish()
    }
}

/// Lazy walk over the live entries.
///
/// Entries present for the whole walk are yielded exactly once; entries
/// inserted or removed meanwhile may or may not show up.
pub(crate) struct Iter<'a, K, V> {
    list: &'a SplitOrderedList<K, V>,
    guards: Guards,
    cur: *mut Node<K, V>,
    /// Split key of the last yielded entry, and the keys yielded with it.
    last: Option<u32>,
    run: Vec<K>,
}

impl<'a, K, V> Iter<'a, K, V>
where
    K: Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn unseen(&self, split_key: u32, key: &K) -> bool {
        match self.last {
            None => true,
            Some(last) => split_key > last || (split_key == last && !self.run.contains(key)),
        }
    }

    fn record(&mut self, split_key: u32, key: K) {
        if self.last != Some(split_key) {
            self.last = Some(split_key);
            self.run.clear();
        }
        self.run.push(key);
    }

    /// Restarts from the sentinel of the bucket holding the last yielded entry.
    fn resume(&mut self) {
        let bucket = match self.last {
            None => 0,
            Some(split_key) => {
                let hash = split_key.reverse_bits() & !REGULAR_BIT;
                hash as usize & (self.list.size.load(Ordering::Acquire) - 1)
            }
        };

        self.cur = self.list.sentinel(bucket, &mut self.guards);
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Clone + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = unsafe { &*self.cur };
            let (next, tagged) = node.next.load();

            // A tagged node may already be unlinked; its successor can't be trusted.
            if tagged {
                self.resume();
                continue;
            }

            if next.is_null() {
                return None;
            }

            self.guards.prev.protect_raw(next);
            if node.next.load() != (next, false) {
                continue;
            }

            core::mem::swap(&mut self.guards.prev, &mut self.guards.cur);
            self.cur = next;

            let node = unsafe { &*next };
            let Some(key) = node.key.as_ref() else {
                continue;
            };

            if !self.unseen(node.split_key, key) {
                continue;
            }

            let value = reclaim::protect(&node.value, &mut self.guards.value);
            if value.is_null() {
                continue;
            }

            let value = unsafe { (*value).clone() };
            self.record(node.split_key, key.clone());

            return Some((key.clone(), value));
        }
    }
}
