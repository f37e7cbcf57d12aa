//! Spin-locked allocator wrapper.
//!
//! The only supported way to share the bump and TLSF backends across threads.
//! The whole wrapper is cache-line aligned so the lock word does not false-share
//! with neighbouring data.

use std::alloc::Layout;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Allocator, AllocatorKind};

/// Cache line size assumed for padding.
pub const CACHE_LINE_SIZE: usize = 64;

/// Wraps any allocator behind a spin lock, making it `Sync`.
#[repr(align(64))]
pub struct ThreadSafeAlloc<A: Allocator> {
    locked: AtomicBool,
    inner: A,
}

// SAFETY: every access to `inner` goes through the spin lock.
unsafe impl<A: Allocator + Send> Sync for ThreadSafeAlloc<A> {}

impl<A: Allocator> ThreadSafeAlloc<A> {
    pub fn new(inner: A) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner,
        }
    }

    /// Consume the wrapper and hand the inner allocator back.
    pub fn into_inner(self) -> A {
        self.inner
    }

    fn with_lock<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let result = f(&self.inner);
        self.locked.store(false, Ordering::Release);
        result
    }

    /// Run a closure against the inner allocator under the lock.
    pub fn with_inner<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        self.with_lock(f)
    }
}

impl<A: Allocator> Allocator for ThreadSafeAlloc<A> {
    fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_lock(|a| a.alloc(layout))
    }

    fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        self.with_lock(|a| a.realloc(ptr, old_layout, new_size))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: forwarded contract; caller guarantees ptr/layout.
        self.with_lock(|a| unsafe { a.dealloc(ptr, layout) })
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::ThreadSafe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::bump::BumpAlloc;
    use crate::util::size::mb;
    use std::sync::Arc;

    #[test]
    fn test_wrapper_is_cache_line_aligned() {
        assert_eq!(
            std::mem::align_of::<ThreadSafeAlloc<BumpAlloc>>(),
            CACHE_LINE_SIZE
        );
    }

    #[test]
    fn test_concurrent_allocation() {
        let shared = Arc::new(ThreadSafeAlloc::new(
            BumpAlloc::with_reserve(mb(16)).unwrap(),
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = shared.clone();
                std::thread::spawn(move || {
                    let layout = Layout::from_size_align(64, 16).unwrap();
                    for _ in 0..1000 {
                        let p = alloc.alloc(layout);
                        assert!(!p.is_null());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(
            shared.with_inner(|b| b.allocated_size()),
            4 * 1000 * 64
        );
    }
}
