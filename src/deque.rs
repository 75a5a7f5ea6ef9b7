//! A growable Chase–Lev work-stealing deque.
//!
//! - Single owner: `push_bottom` / `pop_bottom` / `peek_bottom`
//! - Any thread: `pop_top` (steal) / `peek_top` / `peek_at`
//!
//! Slots hold pointers to boxed items. Items and replaced buffers are retired
//! to the hazard-pointer domain, so a stealer reading a stale buffer or a
//! peeker cloning an item never touches freed memory.

use crate::reclaim;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr::null_mut;
use core::sync::atomic::{fence, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use crossbeam_utils::Backoff;

/// Outcome of a pop from either end.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Pop<T> {
    Succeed(T),
    /// Nothing to pop.
    Empty,
    /// Lost a race on `top` to another thread; the deque may still hold items.
    Abort,
}

/// Set in `readers` once the item's value has been claimed by a pop.
const TAKEN: usize = 1 << (usize::BITS - 1);

struct Item<T> {
    value: ManuallyDrop<T>,
    readers: AtomicUsize,
}

impl<T> Item<T> {
    fn new(value: T) -> *mut Self {
        Box::into_raw(Box::new(Item {
            value: ManuallyDrop::new(value),
            readers: AtomicUsize::new(0),
        }))
    }

    /// Moves the value out and retires the box.
    ///
    /// # Safety
    /// The caller must have won the item: exactly one `take` per item.
    unsafe fn take(raw: *mut Self) -> T
    where
        T: Send + 'static,
    {
        let item = &*raw;
        item.readers.fetch_or(TAKEN, Ordering::SeqCst);

        let backoff = Backoff::new();
        while item.readers.load(Ordering::Acquire) != TAKEN {
            backoff.snooze();
        }

        let value = core::ptr::read(&*item.value);
        reclaim::retire(raw);
        value
    }

    /// Clones the value unless a pop has already claimed it.
    fn read(&self) -> Option<T>
    where
        T: Clone,
    {
        let readers = Reader::enter(&self.readers);
        if readers.before & TAKEN != 0 {
            return None;
        }

        Some((*self.value).clone())
    }
}

/// One registration in an item's reader count, released on drop so a
/// panicking `clone` cannot leave `take` waiting forever.
struct Reader<'a> {
    readers: &'a AtomicUsize,
    before: usize,
}

impl<'a> Reader<'a> {
    fn enter(readers: &'a AtomicUsize) -> Self {
        let before = readers.fetch_add(1, Ordering::SeqCst);
        Reader { readers, before }
    }
}

impl Drop for Reader<'_> {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::Release);
    }
}

struct Buffer<T> {
    slots: Box<[AtomicPtr<Item<T>>]>,
    mask: isize,
}

impl<T> Buffer<T> {
    fn alloc(capacity: usize) -> *mut Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| AtomicPtr::new(null_mut())).collect();
        Box::into_raw(Box::new(Buffer {
            slots,
            mask: capacity as isize - 1,
        }))
    }

    fn capacity(&self) -> isize {
        self.mask + 1
    }

    fn slot(&self, index: isize) -> &AtomicPtr<Item<T>> {
        &self.slots[(index & self.mask) as usize]
    }
}

pub(crate) struct CyclicDeque<T> {
    top: AtomicIsize,
    bottom: AtomicIsize,
    buffer: AtomicPtr<Buffer<T>>,
    _marker: PhantomData<Box<Item<T>>>,
}

impl<T> CyclicDeque<T> {
    /// `capacity` is rounded up to a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        CyclicDeque {
            top: AtomicIsize::new(0),
            bottom: AtomicIsize::new(0),
            buffer: AtomicPtr::new(Buffer::alloc(capacity.max(1).next_power_of_two())),
            _marker: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::SeqCst);
        let t = self.top.load(Ordering::SeqCst);
        (b - t).max(0) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current `[top, bottom)` index window.
    pub(crate) fn bounds(&self) -> (isize, isize) {
        let t = self.top.load(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::SeqCst);
        (t, b)
    }
}

impl<T> CyclicDeque<T>
where
    T: Send + Sync + 'static,
{
    /// # Safety
    /// Only the owning thread may call this.
    pub(crate) unsafe fn push_bottom(&self, value: T) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        if b - t >= (*buffer).capacity() {
            buffer = self.grow(buffer, t, b);
        }

        (*buffer).slot(b).store(Item::new(value), Ordering::Relaxed);

        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Release);
    }

    /// # Safety
    /// Only the owning thread may call this.
    unsafe fn grow(&self, old: *mut Buffer<T>, t: isize, b: isize) -> *mut Buffer<T> {
        let capacity = (*old).capacity() as usize * 2;
        let new = Buffer::alloc(capacity);

        for i in t..b {
            (*new)
                .slot(i)
                .store((*old).slot(i).load(Ordering::Relaxed), Ordering::Relaxed);
        }

        self.buffer.store(new, Ordering::SeqCst);
        log::trace!("deque buffer grew to {} slots", capacity);

        // The old buffer only owns its slot array; the items moved over.
        reclaim::retire(old);

        new
    }

    /// # Safety
    /// Only the owning thread may call this.
    pub(crate) unsafe fn pop_bottom(&self) -> Pop<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);

        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            self.bottom.store(b + 1, Ordering::Relaxed);
            return Pop::Empty;
        }

        let item = (*buffer).slot(b).load(Ordering::Relaxed);

        if t == b {
            // Last item: settle the race with stealers on `top`.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();

            self.bottom.store(b + 1, Ordering::Relaxed);

            if !won {
                return Pop::Empty;
            }
        }

        Pop::Succeed(Item::take(item))
    }

    /// Steals the oldest item. Safe to call from any thread.
    pub(crate) fn pop_top(&self) -> Pop<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return Pop::Empty;
        }

        let mut buffer_hazard = reclaim::hazard();
        let buffer = reclaim::protect(&self.buffer, &mut buffer_hazard);
        let item = unsafe { (*buffer).slot(t).load(Ordering::Relaxed) };

        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Pop::Abort;
        }

        Pop::Succeed(unsafe { Item::take(item) })
    }

    /// # Safety
    /// Only the owning thread may call this.
    pub(crate) unsafe fn peek_bottom(&self) -> Option<T>
    where
        T: Clone,
    {
        let b = self.bottom.load(Ordering::Relaxed);
        self.peek_at(b - 1)
    }

    /// Best effort: gives up rather than retry when it loses a race.
    pub(crate) fn peek_top(&self) -> Option<T>
    where
        T: Clone,
    {
        let t = self.top.load(Ordering::Acquire);
        self.peek_at(t)
    }

    /// Clones the item at logical `index` if it is still in the deque.
    pub(crate) fn peek_at(&self, index: isize) -> Option<T>
    where
        T: Clone,
    {
        let (t, b) = self.bounds();
        if index < t || index >= b {
            return None;
        }

        let mut buffer_hazard = reclaim::hazard();
        let mut item_hazard = reclaim::hazard();

        let buffer = reclaim::protect(&self.buffer, &mut buffer_hazard);
        let item = unsafe { (*buffer).slot(index).load(Ordering::SeqCst) };
        if item.is_null() {
            return None;
        }

        item_hazard.protect_raw(item);

        if !self.still_holds(buffer, index, item) {
            return None;
        }

        unsafe { (*item).read() }
    }

    /// Whether `item` sat at `index` of the live buffer after it was protected.
    fn still_holds(&self, buffer: *mut Buffer<T>, index: isize, item: *mut Item<T>) -> bool {
        if !core::ptr::eq(self.buffer.load(Ordering::SeqCst), buffer) {
            return false;
        }

        let slot = unsafe { (*buffer).slot(index).load(Ordering::SeqCst) };
        let (t, b) = self.bounds();

        core::ptr::eq(slot, item) && t <= index && index < b
    }
}

impl<T> Drop for CyclicDeque<T> {
    fn drop(&mut self) {
        let t = *self.top.get_mut();
        let b = *self.bottom.get_mut();
        let buffer = *self.buffer.get_mut();

        unsafe {
            for i in t..b {
                let item = (*buffer).slot(i).load(Ordering::Relaxed);
                let mut item = Box::from_raw(item);
                ManuallyDrop::drop(&mut item.value);
            }

            drop(Box::from_raw(buffer));
        }
    }
}

impl<T> core::fmt::Debug for CyclicDeque<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (top, bottom) = self.bounds();
        f.debug_struct("CyclicDeque")
            .field("top", &top)
            .field("bottom", &bottom)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_owner_lifo() {
        let deque = CyclicDeque::new(4);

        unsafe {
            deque.push_bottom(1);
            deque.push_bottom(2);
            deque.push_bottom(3);

            assert_eq!(deque.pop_bottom(), Pop::Succeed(3));
            assert_eq!(deque.pop_bottom(), Pop::Succeed(2));
            assert_eq!(deque.pop_bottom(), Pop::Succeed(1));
            assert_eq!(deque.pop_bottom(), Pop::Empty);
        }

        assert!(deque.is_empty());
    }

    #[test]
    fn test_steal_fifo() {
        let deque = CyclicDeque::new(4);

        unsafe {
            (0..3).for_each(|i| deque.push_bottom(i));
        }

        assert_eq!(deque.pop_top(), Pop::Succeed(0));
        assert_eq!(deque.pop_top(), Pop::Succeed(1));
        assert_eq!(deque.pop_top(), Pop::Succeed(2));
        assert_eq!(deque.pop_top(), Pop::Empty);
    }

    #[test]
    fn test_grow_keeps_items() {
        let deque = CyclicDeque::new(2);

        unsafe {
            (0..100).for_each(|i| deque.push_bottom(i));
        }

        assert_eq!(deque.len(), 100);
        assert_eq!(deque.peek_top(), Some(0));
        assert_eq!(unsafe { deque.peek_bottom() }, Some(99));
        assert_eq!(deque.peek_at(42), Some(42));
        assert_eq!(deque.peek_at(100), None);

        let drained: Vec<i32> = std::iter::from_fn(|| match deque.pop_top() {
            Pop::Succeed(v) => Some(v),
            _ => None,
        })
        .collect();

        assert_eq!(drained, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let deque = CyclicDeque::new(8);

        assert_eq!(deque.peek_top(), None);

        unsafe {
            deque.push_bottom(String::from("a"));
            deque.push_bottom(String::from("b"));
        }

        assert_eq!(deque.peek_top().as_deref(), Some("a"));
        assert_eq!(unsafe { deque.peek_bottom() }.as_deref(), Some("b"));
        assert_eq!(deque.len(), 2);
    }

    #[test]
    fn test_steal_from_other_threads() {
        let deque = Arc::new(CyclicDeque::new(16));

        unsafe {
            (0..1000usize).for_each(|i| deque.push_bottom(i));
        }

        let mut threads = vec![];

        for _ in 0..4 {
            let deque = deque.clone();
            threads.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match deque.pop_top() {
                        Pop::Succeed(x) => got.push(x),
                        Pop::Abort => continue,
                        Pop::Empty => break,
                    }
                }
                got
            }));
        }

        let mut remaining = Vec::new();
        while let Pop::Succeed(x) = unsafe { deque.pop_bottom() } {
            remaining.push(x);
        }

        let mut seen = vec![false; 1000];
        for x in threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .chain(remaining)
        {
            assert!(!seen[x], "duplicate item {x}");
            seen[x] = true;
        }

        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn test_drop_releases_items() {
        let tracked = Arc::new(());

        {
            let deque = CyclicDeque::new(2);
            unsafe {
                (0..10).for_each(|_| deque.push_bottom(tracked.clone()));
            }
            assert_eq!(Arc::strong_count(&tracked), 11);
        }

        assert_eq!(Arc::strong_count(&tracked), 1);
    }

    struct Fragile(u32);

    impl Clone for Fragile {
        fn clone(&self) -> Self {
            panic!("clone of {} failed", self.0)
        }
    }

    #[test]
    fn test_panicking_peek_leaves_item_takeable() {
        let deque = CyclicDeque::new(4);

        unsafe {
            deque.push_bottom(Fragile(7));
        }

        let peeked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| deque.peek_top()));
        assert!(peeked.is_err());

        assert!(matches!(deque.pop_top(), Pop::Succeed(Fragile(7))));
        assert!(deque.is_empty());
    }
}
