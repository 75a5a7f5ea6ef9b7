use crate::reclaim::{self, Hazard, UNIQUE_FAMILY};
use crate::MaybeTagged;
use core::marker::PhantomData;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;

pub(crate) struct Node<V> {
    val: V,
    next: MaybeTagged<Self>,
}

impl<V> Node<V> {
    fn new(val: V) -> *mut Self {
        Box::into_raw(Box::new(Node {
            val,
            next: MaybeTagged::new(null_mut()),
        }))
    }

    unsafe fn free(raw: *mut Self) {
        drop(Box::from_raw(raw));
    }
}

/// A chain of `count` nodes detached while iterators were live.
struct Parked<V> {
    first: *mut Node<V>,
    count: usize,
    next: *mut Parked<V>,
}

/// A lock-free LIFO stack (Treiber stack).
///
/// Popped nodes are retired to a hazard-pointer domain, so values handed out
/// through [`Entry`] and [`NodeRef`] stay valid while the guard lives. Nodes
/// popped while an iterator is live are parked instead, and only retired once
/// the last iterator is dropped.
pub struct ConcurrentStack<V> {
    head: CachePadded<MaybeTagged<Node<V>>>,
    len: CachePadded<AtomicUsize>,
    iterators: CachePadded<AtomicUsize>,
    parked: AtomicPtr<Parked<V>>,
    _marker: PhantomData<Box<Node<V>>>,
}

impl<V> ConcurrentStack<V> {
    pub fn new() -> Self {
        ConcurrentStack {
            head: CachePadded::new(MaybeTagged::new(null_mut())),
            len: CachePadded::new(AtomicUsize::new(0)),
            iterators: CachePadded::new(AtomicUsize::new(0)),
            parked: AtomicPtr::new(null_mut()),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        let len = self.len.load(Ordering::Relaxed);
        if len > isize::MAX as usize {
            0
        } else {
            len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load_ptr().is_null()
    }
}

impl<V> ConcurrentStack<V>
where
    V: Send + Sync + 'static,
{
    pub fn push(&self, val: V) {
        let node_ptr = Node::new(val);

        self.link(node_ptr, node_ptr);

        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Pushes every item with a single CAS; the last item ends up on top.
    pub fn push_range<I>(&self, vals: I)
    where
        I: IntoIterator<Item = V>,
    {
        let mut vals = vals.into_iter();
        let Some(first) = vals.next() else {
            return;
        };

        let bottom = Node::new(first);
        let mut top = bottom;
        let mut pushed = 1;

        for val in vals {
            let node_ptr = Node::new(val);
            unsafe {
                (*node_ptr).next.store_ptr(top);
            }
            top = node_ptr;
            pushed += 1;
        }

        self.link(top, bottom);

        self.len.fetch_add(pushed, Ordering::Relaxed);
    }

    /// Publishes the private chain `first ..= last` above the current head.
    fn link(&self, first: *mut Node<V>, last: *mut Node<V>) {
        let mut head_ptr = self.head.load_ptr();

        unsafe {
            (*last).next.store_ptr(head_ptr);
        }

        while let Err((now, _)) =
            self.head
                .compare_exchange(head_ptr, first, Ordering::AcqRel, Ordering::Relaxed)
        {
            unsafe {
                (*last).next.store_ptr(now);
            }
            head_ptr = now;
        }
    }

    pub fn try_pop(&self) -> Option<Entry<'_, V>> {
        loop {
            let old_head = NodeRef::from_maybe_tagged(&self.head)?;

            let next_ptr = old_head.node().next.load_ptr();

            if self
                .head
                .compare_exchange(
                    old_head.as_ptr(),
                    next_ptr,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);

                unsafe {
                    self.release(old_head.as_ptr(), 1);
                }

                return Some(Entry { node: old_head });
            }
        }
    }

    /// Detaches up to `count` nodes from the top with a single CAS and
    /// returns their values in pop order.
    pub fn try_pop_range(&self, count: usize) -> Vec<V>
    where
        V: Clone,
    {
        if count == 0 {
            return Vec::new();
        }

        let mut first_hazard = reclaim::hazard();
        let mut last_hazard = reclaim::hazard();
        let mut next_hazard = reclaim::hazard();

        'retry: loop {
            let first = protect_link(&self.head, &mut first_hazard);
            if first.is_null() {
                return Vec::new();
            }

            let mut last = first;
            let mut taken = 1;

            // Nothing below `first` can be popped while it is still the head,
            // so re-reading the head validates each newly protected node.
            while taken < count {
                let next = unsafe { (*last).next.load_ptr() };
                if next.is_null() {
                    break;
                }

                next_hazard.protect_raw(next);
                if !core::ptr::eq(self.head.load_ptr(), first) {
                    continue 'retry;
                }

                core::mem::swap(&mut last_hazard, &mut next_hazard);
                last = next;
                taken += 1;
            }

            let new_head = unsafe { (*last).next.load_ptr() };

            if self
                .head
                .compare_exchange(first, new_head, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue 'retry;
            }

            let mut vals = Vec::with_capacity(taken);
            let mut curr = first;
            for _ in 0..taken {
                let node = unsafe { &*curr };
                vals.push(node.val.clone());
                curr = node.next.load_ptr();
            }

            self.len.fetch_sub(taken, Ordering::Relaxed);

            unsafe {
                self.release(first, taken);
            }

            return vals;
        }
    }

    pub fn try_peek(&self) -> Option<NodeRef<'_, V>> {
        NodeRef::from_maybe_tagged(&self.head)
    }

    /// Walks the stack top-down starting from the head observed now.
    ///
    /// The walk yields exactly the items that were on the stack at the call,
    /// even if they are popped while it runs. Items pushed afterwards are
    /// never yielded.
    pub fn iter(&self) -> Iter<'_, V> {
        self.iterators.fetch_add(1, Ordering::SeqCst);

        Iter {
            stack: self,
            next: self.try_peek(),
        }
    }

    /// Detaches everything currently on the stack.
    ///
    /// Pushes racing with the clear either land before it and are discarded,
    /// or land after it and survive.
    pub fn clear(&self) {
        let mut old_head = self.head.load_ptr();

        while let Err((now, _)) =
            self.head
                .compare_exchange(old_head, null_mut(), Ordering::SeqCst, Ordering::SeqCst)
        {
            old_head = now;
        }

        let mut detached = 0;
        let mut curr = old_head;
        while !curr.is_null() {
            curr = unsafe { (*curr).next.load_ptr() };
            detached += 1;
        }

        self.len.fetch_sub(detached, Ordering::Relaxed);

        unsafe {
            self.release(old_head, detached);
        }
    }

    /// Retires a detached chain, or parks it while an iterator may still be
    /// walking through it.
    ///
    /// # Safety
    /// The `count` nodes starting at `first` must be detached and owned by the caller.
    unsafe fn release(&self, first: *mut Node<V>, count: usize) {
        if count == 0 {
            return;
        }

        if self.iterators.load(Ordering::SeqCst) == 0 {
            retire_chain(first, count);
            return;
        }

        let parked = Box::into_raw(Box::new(Parked {
            first,
            count,
            next: null_mut(),
        }));

        let mut head = self.parked.load(Ordering::SeqCst);
        loop {
            (*parked).next = head;
            match self.parked.compare_exchange_weak(
                head,
                parked,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(now) => head = now,
            }
        }

        // The last iterator may have drained before this chain was parked.
        if self.iterators.load(Ordering::SeqCst) == 0 {
            self.drain();
        }
    }

    /// Retires every parked chain.
    ///
    /// # Safety
    /// No iterator that was live when a chain got parked may still be live.
    unsafe fn drain(&self) {
        let mut parked = self.parked.swap(null_mut(), Ordering::SeqCst);

        while !parked.is_null() {
            let chain = Box::from_raw(parked);
            retire_chain(chain.first, chain.count);
            parked = chain.next;
        }
    }
}

/// # Safety
/// The `count` nodes starting at `first` must be detached and owned by the caller.
unsafe fn retire_chain<V: Send + 'static>(first: *mut Node<V>, count: usize) {
    let mut curr = first;
    for _ in 0..count {
        let next = (*curr).next.load_ptr();
        reclaim::retire(curr);
        curr = next;
    }
}

fn protect_link<V>(link: &MaybeTagged<Node<V>>, hazard: &mut Hazard) -> *mut Node<V> {
    let mut ptr = link.load_ptr();

    hazard.protect_raw(ptr);

    let mut v_ptr = link.load_ptr();

    while !core::ptr::eq(ptr, v_ptr) {
        ptr = v_ptr;
        hazard.protect_raw(ptr);

        v_ptr = link.load_ptr();
    }

    ptr
}

impl<V> Default for ConcurrentStack<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> core::fmt::Debug for ConcurrentStack<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConcurrentStack")
            .field("len", &self.len())
            .finish()
    }
}

impl<V> Drop for ConcurrentStack<V> {
    fn drop(&mut self) {
        let mut curr = self.head.load_ptr();

        unsafe {
            while !curr.is_null() {
                let next = (*curr).next.load_ptr();
                Node::free(curr);
                curr = next;
            }

            let mut parked = *self.parked.get_mut();
            while !parked.is_null() {
                let chain = Box::from_raw(parked);
                let mut curr = chain.first;
                for _ in 0..chain.count {
                    let next = (*curr).next.load_ptr();
                    Node::free(curr);
                    curr = next;
                }
                parked = chain.next;
            }
        }

        UNIQUE_FAMILY.eager_reclaim();
    }
}

/// A protected reference to a value that was on the stack when it was read.
pub struct NodeRef<'a, V> {
    node: NonNull<Node<V>>,
    _hazard: Hazard,
    _stack: PhantomData<&'a ConcurrentStack<V>>,
}

impl<'a, V> NodeRef<'a, V> {
    fn as_ptr(&self) -> *mut Node<V> {
        self.node.as_ptr()
    }

    fn node(&self) -> &Node<V> {
        unsafe { self.node.as_ref() }
    }

    fn from_maybe_tagged(maybe_tagged: &MaybeTagged<Node<V>>) -> Option<Self> {
        let mut _hazard = reclaim::hazard();
        let ptr = protect_link(maybe_tagged, &mut _hazard);

        NonNull::new(ptr).map(|node| NodeRef {
            node,
            _hazard,
            _stack: PhantomData,
        })
    }

    /// Protects the node below this one.
    ///
    /// # Safety
    /// The caller must be a live iterator whose walk reached this node, so
    /// nothing below it has been retired yet.
    unsafe fn successor(&self) -> Option<Self> {
        let next = NonNull::new(self.node().next.load_ptr())?;

        let mut _hazard = reclaim::hazard();
        _hazard.protect_raw(next.as_ptr());

        Some(NodeRef {
            node: next,
            _hazard,
            _stack: PhantomData,
        })
    }
}

impl<'a, V> core::ops::Deref for NodeRef<'a, V> {
    type Target = V;
    fn deref(&self) -> &Self::Target {
        &self.node().val
    }
}

/// A popped value, kept alive until the guard is dropped.
pub struct Entry<'a, V> {
    node: NodeRef<'a, V>,
}

impl<'a, V> core::ops::Deref for Entry<'a, V> {
    type Target = V;
    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

impl<'a, V> core::ops::Drop for Entry<'a, V> {
    fn drop(&mut self) {
        UNIQUE_FAMILY.eager_reclaim();
    }
}

/// A snapshot walk over a [`ConcurrentStack`].
///
/// While any of these is live, popped nodes are parked rather than retired.
pub struct Iter<'a, V>
where
    V: Send + Sync + 'static,
{
    stack: &'a ConcurrentStack<V>,
    next: Option<NodeRef<'a, V>>,
}

impl<'a, V> Iterator for Iter<'a, V>
where
    V: Send + Sync + 'static,
{
    type Item = NodeRef<'a, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = unsafe { next.successor() };
        Some(next)
    }
}

impl<'a, V> Drop for Iter<'a, V>
where
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.stack.iterators.fetch_sub(1, Ordering::SeqCst) == 1 {
            unsafe {
                self.stack.drain();
            }
        }
    }
}

impl<'a, V> IntoIterator for &'a ConcurrentStack<V>
where
    V: Send + Sync + 'static,
{
    type Item = NodeRef<'a, V>;
    type IntoIter = Iter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicIsize;
    use std::sync::Arc;

    #[test]
    fn test_push_front() {
        let stack = ConcurrentStack::new();

        stack.push(1);

        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);

        assert_eq!(stack.len(), 1);
        assert!(!stack.is_empty());
    }

    #[test]
    fn test_lifo() {
        let stack = ConcurrentStack::new();

        (0..100).for_each(|i| stack.push(i));

        let popped: Vec<i32> = std::iter::from_fn(|| stack.try_pop().map(|e| *e)).collect();
        let expected: Vec<i32> = (0..100).rev().collect();

        assert_eq!(popped, expected);
        assert_eq!(stack.len(), 0);
        assert!(stack.try_pop().is_none());
    }

    #[test]
    fn test_push_pop_sync() {
        let stack = Arc::new(ConcurrentStack::new());
        let balance = Arc::new(AtomicIsize::new(0));

        let mut threads = vec![];

        for i in 0..10 {
            let stack = stack.clone();
            let balance = balance.clone();

            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if rand::random::<u8>() % 3 != 0 {
                        stack.push(i);
                        balance.fetch_add(1, Ordering::Relaxed);
                    } else if stack.try_pop().is_some() {
                        balance.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }))
        }

        for thead in threads {
            thead.join().unwrap();
        }

        let balance = balance.load(Ordering::Relaxed) as usize;
        assert_eq!(stack.len(), balance);
        assert_eq!(stack.iter().count(), balance);
    }

    #[test]
    fn test_push_range_pop_range() {
        let stack = ConcurrentStack::new();

        stack.push(0);
        stack.push_range(vec![1, 2, 3]);

        assert_eq!(stack.len(), 4);
        assert_eq!(*stack.try_peek().unwrap(), 3);
        assert_eq!(stack.try_pop_range(3), vec![3, 2, 1]);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.try_pop_range(5), vec![0]);
        assert!(stack.try_pop_range(5).is_empty());
        assert!(stack.try_pop_range(0).is_empty());
    }

    #[test]
    fn test_push_range_empty() {
        let stack: ConcurrentStack<u8> = ConcurrentStack::new();

        stack.push_range(Vec::new());

        assert!(stack.is_empty());
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_iter_snapshot() {
        let expected = vec![2, 3, 7, 2, 0, 0, 3, 4, 2, 5];

        let stack = ConcurrentStack::new();

        expected.iter().rev().for_each(|&e| stack.push(e));

        let mut iter = stack.iter();
        let first = iter.next().map(|e| *e);

        stack.push(99);

        let mut actual: Vec<i32> = first.into_iter().collect();
        actual.extend(iter.map(|e| *e));

        assert_eq!(expected, actual);
    }

    #[test]
    fn test_iter_survives_pops() {
        let stack = ConcurrentStack::new();

        stack.push_range(vec![1, 2, 3, 4]);

        let mut iter = stack.iter();
        assert_eq!(iter.next().map(|e| *e), Some(4));

        while stack.try_pop().is_some() {}
        assert!(stack.is_empty());

        let rest: Vec<i32> = iter.map(|e| *e).collect();
        assert_eq!(rest, vec![3, 2, 1]);
    }

    #[test]
    fn test_iter_survives_pop_range_and_clear() {
        let stack = ConcurrentStack::new();

        stack.push_range(vec![1, 2, 3]);

        let mut iter = stack.iter();
        let top = iter.next().unwrap();
        assert_eq!(*top, 3);

        assert_eq!(stack.try_pop_range(2), vec![3, 2]);
        stack.push(9);
        stack.clear();

        assert_eq!(iter.next().map(|e| *e), Some(2));
        assert_eq!(iter.next().map(|e| *e), Some(1));
        assert!(iter.next().is_none());

        drop(iter);
        assert_eq!(*top, 3);
    }

    #[test]
    fn test_parked_nodes_are_reclaimed() {
        let tracked = Arc::new(());

        {
            let stack = ConcurrentStack::new();
            stack.push_range((0..4).map(|_| tracked.clone()));

            let iter = stack.iter();
            while stack.try_pop().is_some() {}
            assert_eq!(iter.count(), 4);

            stack.push(tracked.clone());
            stack.clear();

            let parked = stack.iter();
            stack.push(tracked.clone());
            assert!(stack.try_pop().is_some());
            drop(parked);
        }

        for _ in 0..1000 {
            if Arc::strong_count(&tracked) == 1 {
                break;
            }
            UNIQUE_FAMILY.eager_reclaim();
            std::thread::yield_now();
        }

        assert_eq!(Arc::strong_count(&tracked), 1);
    }

    #[test]
    fn test_clear() {
        let stack = ConcurrentStack::new();

        stack.push_range(0..50);
        stack.clear();

        assert!(stack.is_empty());
        assert_eq!(stack.len(), 0);

        stack.push(7);
        assert_eq!(stack.len(), 1);
        assert_eq!(*stack.try_pop().unwrap(), 7);
    }

    #[test]
    fn test_drop_releases_values() {
        let tracked = Arc::new(());

        {
            let stack = ConcurrentStack::new();
            for _ in 0..10 {
                stack.push(tracked.clone());
            }
            assert_eq!(Arc::strong_count(&tracked), 11);
        }

        assert_eq!(Arc::strong_count(&tracked), 1);
    }
}
