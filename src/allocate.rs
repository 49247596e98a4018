//! Zero-initialized boxed allocation used for page-aligned structures.

use {
    alloc::{
        alloc::{alloc_zeroed, handle_alloc_error},
        boxed::Box,
    },
    core::alloc::Layout,
};

/// Allocates and zeros memory for a given type, returning a boxed instance.
///
/// # Safety
///
/// All-zeroes must be a valid bit pattern for `T`.
///
/// # Panics
///
/// Panics if memory allocation fails.
pub unsafe fn box_zeroed<T>() -> Box<T> {
    let layout = Layout::new::<T>();
    let ptr = unsafe { alloc_zeroed(layout) }.cast::<T>();
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    unsafe { Box::from_raw(ptr) }
}
