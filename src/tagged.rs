use core::sync::atomic::{AtomicPtr, Ordering};

const TAG: usize = 1;

/// An atomic pointer whose lowest bit doubles as a deletion mark.
///
/// Pointees must be at least 2-byte aligned, which every node type in this
/// crate is since they all hold atomics.
pub(crate) struct MaybeTagged<T> {
    raw: AtomicPtr<T>,
}

fn compose<T>(ptr: *mut T, tagged: bool) -> *mut T {
    debug_assert_eq!(ptr as usize & TAG, 0);
    if tagged {
        ptr.cast::<u8>().wrapping_add(TAG).cast()
    } else {
        ptr
    }
}

fn decompose<T>(raw: *mut T) -> (*mut T, bool) {
    let tag = raw as usize & TAG;
    (raw.cast::<u8>().wrapping_sub(tag).cast(), tag == TAG)
}

impl<T> MaybeTagged<T> {
    pub(crate) fn new(ptr: *mut T) -> Self {
        MaybeTagged {
            raw: AtomicPtr::new(compose(ptr, false)),
        }
    }

    pub(crate) fn load(&self) -> (*mut T, bool) {
        decompose(self.raw.load(Ordering::SeqCst))
    }

    pub(crate) fn load_ptr(&self) -> *mut T {
        self.load().0
    }

    pub(crate) fn store_ptr(&self, ptr: *mut T) {
        self.raw.store(compose(ptr, false), Ordering::SeqCst);
    }

    /// Swaps in `new` (untagged) if the link currently holds `current` untagged.
    ///
    /// On failure the observed pointer and tag are returned.
    pub(crate) fn compare_exchange(
        &self,
        current: *mut T,
        new: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(*mut T, bool), (*mut T, bool)> {
        self.raw
            .compare_exchange(
                compose(current, false),
                compose(new, false),
                success,
                failure,
            )
            .map(decompose)
            .map_err(decompose)
    }

    /// Sets the tag, keeping the pointer. Returns `true` if this call set it.
    pub(crate) fn tag(&self) -> bool {
        let mut raw = self.raw.load(Ordering::SeqCst);

        loop {
            let (ptr, tagged) = decompose(raw);
            if tagged {
                return false;
            }

            match self.raw.compare_exchange(
                raw,
                compose(ptr, true),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(now) => raw = now,
            }
        }
    }
}
