#![no_main]

use concur::{BagOperation, ConcurrentBag};
use libfuzzer_sys::fuzz_target;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fuzz_target!(|ops: Vec<BagOperation<u16>>| {
    let bag = Arc::new(ConcurrentBag::new());
    let added = Arc::new(AtomicUsize::new(0));
    let taken = Arc::new(AtomicUsize::new(0));

    let mut threads = vec![];

    let len = ops.len();

    for sub_ops in ops.chunks(std::cmp::max(len / 20, 1)) {
        let sub_ops = sub_ops.to_vec();
        let bag: Arc<ConcurrentBag<u16>> = bag.clone();
        let added = added.clone();
        let taken = taken.clone();

        threads.push(std::thread::spawn(move || {
            sub_ops.into_iter().for_each(|op| match op {
                BagOperation::Add { item } => {
                    bag.add(item);
                    added.fetch_add(1, Ordering::Relaxed);
                }
                BagOperation::Take => {
                    if bag.try_take().is_some() {
                        taken.fetch_add(1, Ordering::Relaxed);
                    }
                }
                BagOperation::TakeAdd => {
                    if let Some(item) = bag.try_take() {
                        bag.add(item.wrapping_add(1));
                    }
                }
                BagOperation::Peek => {
                    bag.try_peek();
                }
                BagOperation::Iter => {
                    bag.iter().find(|item| *item % 1021 == 0);
                }
            })
        }))
    }

    for thread in threads {
        thread.join().unwrap()
    }

    let remaining = std::iter::from_fn(|| bag.try_take()).count();
    assert_eq!(
        remaining,
        added.load(Ordering::Relaxed) - taken.load(Ordering::Relaxed)
    );
});
