//! Generic buffer allocator shared by every engine instance on a platform.
//!
//! The engine calls into this allocator for array buffer backing stores:
//!
//! 1. `allocate(n)` returns `n` zeroed bytes
//! 2. `allocate_uninitialized(n)` returns `n` bytes the engine will overwrite
//! 3. `free(ptr, n)` releases a block returned by either of the above
//!
//! Each call is independent, so the allocator can be used from any thread.
//! The only shared state is a byte counter kept for diagnostics.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Stateless-per-call allocator backed by the global Rust allocator.
#[derive(Debug, Default)]
pub struct GenericAllocator {
    /// Bytes currently handed out (atomic for thread-safety)
    count: AtomicUsize,
}

impl GenericAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `n` zero-filled bytes.
    pub fn allocate(&self, n: usize) -> *mut u8 {
        self.count.fetch_add(n, Ordering::Relaxed);
        Box::into_raw(vec![0u8; n].into_boxed_slice()) as *mut u8
    }

    /// Allocate `n` bytes without initializing them.
    pub fn allocate_uninitialized(&self, n: usize) -> *mut u8 {
        self.count.fetch_add(n, Ordering::Relaxed);
        Box::into_raw(Box::<[u8]>::new_uninit_slice(n)) as *mut u8
    }

    /// Release a block.
    ///
    /// # Safety
    ///
    /// `data` must come from `allocate` or `allocate_uninitialized` on this
    /// allocator with the same `n`, and must not be used afterwards.
    pub unsafe fn free(&self, data: *mut u8, n: usize) {
        self.count.fetch_sub(n, Ordering::Relaxed);
        // SAFETY: data was produced by Box::into_raw of a boxed slice of n bytes
        let _ = unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                data as *mut MaybeUninit<u8>,
                n,
            ))
        };
    }

    /// Bytes currently allocated and not yet freed.
    pub fn allocated_bytes(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(feature = "v8")]
mod v8_glue {
    use std::ffi::c_void;
    use std::sync::Arc;

    use v8::{RustAllocatorVtable, UniqueRef};

    use super::GenericAllocator;

    impl GenericAllocator {
        /// Convert to a V8 array buffer allocator for use in `CreateParams`.
        pub fn into_v8_allocator(self: Arc<Self>) -> UniqueRef<v8::Allocator> {
            let vtable: &'static RustAllocatorVtable<GenericAllocator> = &RustAllocatorVtable {
                allocate,
                allocate_uninitialized,
                free,
                drop,
            };

            unsafe { v8::new_rust_allocator(Arc::into_raw(self), vtable) }
        }
    }

    unsafe extern "C" fn allocate(allocator: &GenericAllocator, n: usize) -> *mut c_void {
        allocator.allocate(n) as *mut c_void
    }

    unsafe extern "C" fn allocate_uninitialized(
        allocator: &GenericAllocator,
        n: usize,
    ) -> *mut c_void {
        allocator.allocate_uninitialized(n) as *mut c_void
    }

    unsafe extern "C" fn free(allocator: &GenericAllocator, data: *mut c_void, n: usize) {
        // SAFETY: V8 only frees blocks it got from allocate/allocate_uninitialized
        unsafe { allocator.free(data as *mut u8, n) };
    }

    /// Called when the allocator itself is dropped (isolate destroyed).
    unsafe extern "C" fn drop(allocator: *const GenericAllocator) {
        // SAFETY: allocator was created via Arc::into_raw in into_v8_allocator
        let _ = unsafe { Arc::from_raw(allocator) };
    }
}
