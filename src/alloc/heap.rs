//! System heap backend.
//!
//! Thin wrapper over the global allocator; the default base for proxies and
//! the fallback when no allocator is supplied.

use std::alloc::Layout;
use std::sync::{Arc, OnceLock};

use super::{oom_notify, Allocator, AllocatorKind, AllocatorRef};

/// Allocator backed by the process heap.
#[derive(Debug, Default)]
pub struct HeapAlloc;

impl HeapAlloc {
    pub const fn new() -> Self {
        Self
    }
}

impl Allocator for HeapAlloc {
    fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return std::ptr::null_mut();
        }
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            oom_notify(layout.size());
        }
        ptr
    }

    fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            let layout = match Layout::from_size_align(new_size, old_layout.align()) {
                Ok(l) => l,
                Err(_) => return std::ptr::null_mut(),
            };
            return self.alloc(layout);
        }
        // SAFETY: ptr was allocated by this allocator with old_layout.
        let new_ptr = unsafe { std::alloc::realloc(ptr, old_layout, new_size) };
        if new_ptr.is_null() {
            oom_notify(new_size);
        }
        new_ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !ptr.is_null() {
            std::alloc::dealloc(ptr, layout);
        }
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Heap
    }
}

/// The shared default heap allocator.
pub fn heap() -> AllocatorRef {
    static HEAP: OnceLock<AllocatorRef> = OnceLock::new();
    HEAP.get_or_init(|| Arc::new(HeapAlloc::new())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free() {
        let a = HeapAlloc::new();
        let layout = Layout::from_size_align(64, 16).unwrap();
        let ptr = a.alloc(layout);
        assert!(!ptr.is_null());
        unsafe {
            *ptr = 0xAB;
            assert_eq!(*ptr, 0xAB);
            a.dealloc(ptr, layout);
        }
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let a = HeapAlloc::new();
        let layout = Layout::from_size_align(16, 8).unwrap();
        let ptr = a.alloc(layout);
        unsafe {
            std::ptr::write_bytes(ptr, 0x5A, 16);
            let grown = a.realloc(ptr, layout, 256);
            assert!(!grown.is_null());
            for i in 0..16 {
                assert_eq!(*grown.add(i), 0x5A);
            }
            a.dealloc(grown, Layout::from_size_align(256, 8).unwrap());
        }
    }

    #[test]
    fn test_shared_heap_is_singleton() {
        assert!(Arc::ptr_eq(&heap(), &heap()));
        assert_eq!(heap().kind(), AllocatorKind::Heap);
    }
}
