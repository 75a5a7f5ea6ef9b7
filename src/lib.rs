mod bag;
mod config;
mod deque;
mod dictionary;
mod error;
mod reclaim;
mod split_list;
mod stack;
mod tagged;

pub use bag::ConcurrentBag;
pub use config::{BagConfig, DictionaryConfig};
pub use dictionary::ConcurrentDictionary;
pub use error::{ConcurError, Result};
pub use stack::{ConcurrentStack, Entry, NodeRef};
pub(crate) use tagged::MaybeTagged;

/// Iterator types returned by the collections.
pub mod iter {
    pub use crate::bag::Iter as BagIter;
    pub use crate::dictionary::Iter as DictionaryIter;
    pub use crate::stack::Iter as StackIter;
}

/// A random operation on a [`ConcurrentStack`].
#[cfg(feature = "arbitrary")]
#[derive(Clone, Debug)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum Operation<T> {
    Push { item: T },
    Pop,
    PopPush,
    PushRange { items: Vec<T> },
    PopRange { count: u8 },
    Peek,
    Iter,
    Clear,
}

/// A random operation on a [`ConcurrentBag`].
#[cfg(feature = "arbitrary")]
#[derive(Clone, Debug)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum BagOperation<T> {
    Add { item: T },
    Take,
    TakeAdd,
    Peek,
    Iter,
}

/// A random operation on a [`ConcurrentDictionary`].
#[cfg(feature = "arbitrary")]
#[derive(Clone, Debug)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum MapOperation<K, V> {
    TryAdd { key: K, value: V },
    Set { key: K, value: V },
    AddOrUpdate { key: K, value: V },
    GetOrAdd { key: K, value: V },
    Get { key: K },
    Remove { key: K },
    Update { key: K, value: V, comparison: V },
    Iter,
    Clear,
}
