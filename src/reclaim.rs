use core::sync::atomic::{AtomicPtr, Ordering};
use haphazard::{Domain, HazardPointer, Singleton};

pub(crate) struct UniqueFamily;

unsafe impl Singleton for UniqueFamily {}

/// Every structure in the crate retires into this one domain.
pub(crate) static UNIQUE_FAMILY: Domain<UniqueFamily> = Domain::new(&UniqueFamily);

pub(crate) type Hazard = HazardPointer<'static, UniqueFamily>;

pub(crate) fn hazard() -> Hazard {
    HazardPointer::new_in_domain(&UNIQUE_FAMILY)
}

/// Protects the pointer currently stored in `src` and returns it.
///
/// The returned pointer was still reachable from `src` after the hazard was
/// published, so it cannot be reclaimed until `hazard` is reset or dropped.
pub(crate) fn protect<T>(src: &AtomicPtr<T>, hazard: &mut Hazard) -> *mut T {
    let mut ptr = src.load(Ordering::SeqCst);

    hazard.protect_raw(ptr);

    let mut v_ptr = src.load(Ordering::SeqCst);

    while !core::ptr::eq(ptr, v_ptr) {
        ptr = v_ptr;
        hazard.protect_raw(ptr);

        v_ptr = src.load(Ordering::SeqCst);
    }

    ptr
}

/// Hands a `Box`-allocated object to the domain for deferred dropping.
///
/// The domain is global and may drop the object long after its collection is
/// gone, so nothing it owns may borrow.
///
/// # Safety
/// `ptr` must come from `Box::into_raw`, must be unreachable for new readers,
/// and must be retired exactly once.
pub(crate) unsafe fn retire<T: Send + 'static>(ptr: *mut T) {
    UNIQUE_FAMILY.retire_ptr::<T, Box<T>>(ptr);
}
