#![no_main]

use concur::{ConcurrentStack, Operation};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|ops: Vec<Operation<i32>>| {
    let stack = Arc::new(ConcurrentStack::new());

    let mut threads = vec![];

    let len = ops.len();

    for sub_ops in ops.chunks(std::cmp::max(len / 20, 1)) {
        let sub_ops = sub_ops.to_vec();
        let stack: Arc<ConcurrentStack<i32>> = stack.clone();

        threads.push(std::thread::spawn(move || {
            sub_ops.into_iter().for_each(|op| match op {
                Operation::Push { item } => stack.push(item),
                Operation::Pop => {
                    stack.try_pop();
                }
                Operation::PopPush => {
                    if let Some(e) = stack.try_pop() {
                        stack.push(e.wrapping_mul(*e))
                    }
                }
                Operation::PushRange { items } => stack.push_range(items),
                Operation::PopRange { count } => {
                    stack.try_pop_range(count as usize);
                }
                Operation::Peek => {
                    if let Some(e) = stack.try_peek() {
                        stack.push(*e);
                    }
                }
                Operation::Iter => {
                    stack.iter().find(|item| **item % 10214 == 0);
                }
                Operation::Clear => stack.clear(),
            })
        }))
    }

    for thread in threads {
        thread.join().unwrap()
    }

    assert_eq!(stack.iter().count(), stack.len());
});
