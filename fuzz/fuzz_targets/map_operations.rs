#![no_main]

use concur::{ConcurrentDictionary, MapOperation};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|ops: Vec<MapOperation<u8, u32>>| {
    let map = Arc::new(ConcurrentDictionary::new());

    let mut threads = vec![];

    let len = ops.len();

    for sub_ops in ops.chunks(std::cmp::max(len / 20, 1)) {
        let sub_ops = sub_ops.to_vec();
        let map: Arc<ConcurrentDictionary<u8, u32>> = map.clone();

        threads.push(std::thread::spawn(move || {
            sub_ops.into_iter().for_each(|op| match op {
                MapOperation::TryAdd { key, value } => {
                    map.try_add(key, value);
                }
                MapOperation::Set { key, value } => map.set(key, value),
                MapOperation::AddOrUpdate { key, value } => {
                    map.add_or_update(key, value, |_, old| old.wrapping_add(1));
                }
                MapOperation::GetOrAdd { key, value } => {
                    map.get_or_add(key, value);
                }
                MapOperation::Get { key } => {
                    let _ = map.get(&key);
                }
                MapOperation::Remove { key } => {
                    map.try_remove(&key);
                }
                MapOperation::Update {
                    key,
                    value,
                    comparison,
                } => {
                    map.try_update(&key, value, &comparison);
                }
                MapOperation::Iter => {
                    map.iter().find(|(_, value)| *value % 1021 == 0);
                }
                MapOperation::Clear => map.clear(),
            })
        }))
    }

    for thread in threads {
        thread.join().unwrap()
    }

    let keys = map.keys();
    assert_eq!(keys.len(), map.len());
    for key in keys {
        assert!(map.contains_key(&key));
    }
});
