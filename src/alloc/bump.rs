//! Virtual-memory backed bump allocator.
//!
//! Reserves a large address range up front and commits pages on demand as the
//! offset advances. Freeing is only meaningful for the most recent allocation,
//! which rewinds the offset; everything else is reclaimed by [`BumpAlloc::reset`]
//! or on drop. This is the backing store for the engine init heap.

use std::alloc::Layout;
use std::cell::RefCell;

use crate::util::size::{align_up, kb};

use super::{effective_align, oom_notify, Allocator, AllocatorKind};

/// Default commit granularity.
const DEFAULT_PAGE_SIZE: usize = kb(64);

struct Inner {
    base: *mut u8,
    reserve_size: usize,
    commit_size: usize,
    page_size: usize,
    offset: usize,
    last_ptr: *mut u8,
    last_offset: usize,
}

/// Linear allocator over a reserved virtual range.
///
/// Not internally synchronised; wrap in
/// [`ThreadSafeAlloc`](super::ThreadSafeAlloc) to share across threads.
pub struct BumpAlloc {
    inner: RefCell<Inner>,
}

// SAFETY: the raw base pointer is owned exclusively by this allocator.
unsafe impl Send for BumpAlloc {}

impl BumpAlloc {
    /// Reserve `reserve_size` bytes of address space without committing,
    /// with a `page_size` commit granularity.
    ///
    /// Returns `None` if the reservation fails.
    pub fn new(reserve_size: usize, page_size: usize) -> Option<Self> {
        assert!(reserve_size > 0);
        assert!(page_size.is_power_of_two());

        let reserve_size = align_up(reserve_size, page_size);
        let base = backend::reserve(reserve_size)?;
        Some(Self {
            inner: RefCell::new(Inner {
                base,
                reserve_size,
                commit_size: 0,
                page_size,
                offset: 0,
                last_ptr: std::ptr::null_mut(),
                last_offset: 0,
            }),
        })
    }

    /// Reserve with the default page size.
    pub fn with_reserve(reserve_size: usize) -> Option<Self> {
        Self::new(reserve_size, DEFAULT_PAGE_SIZE)
    }

    /// Bytes of reserved address space.
    pub fn reserved_size(&self) -> usize {
        self.inner.borrow().reserve_size
    }

    /// Bytes currently committed.
    pub fn committed_size(&self) -> usize {
        self.inner.borrow().commit_size
    }

    /// Current allocation offset (== allocated bytes).
    pub fn allocated_size(&self) -> usize {
        self.inner.borrow().offset
    }

    /// Commit the entire reserved range eagerly.
    pub fn commit_all(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        let target = inner.reserve_size;
        inner.commit_to(target)
    }

    /// Shrink the committed region to `target` bytes (rounded up to the page
    /// size). Used by the temp allocator's idle decay; `target` must cover the
    /// current offset.
    pub(crate) fn decommit_to(&self, target: usize) {
        let mut inner = self.inner.borrow_mut();
        let target = align_up(target.max(inner.offset), inner.page_size);
        if target >= inner.commit_size {
            return;
        }
        // SAFETY: the span [base+target, base+commit_size) is committed and
        // inside the reservation.
        unsafe {
            backend::decommit(inner.base.add(target), inner.commit_size - target);
        }
        inner.commit_size = target;
    }

    /// Rewind the offset to zero without decommitting pages.
    pub fn reset(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.offset = 0;
        inner.last_ptr = std::ptr::null_mut();
        inner.last_offset = 0;
    }

    /// Rewind the offset to a previously observed position. Used by temp
    /// frames; `offset` must not be past the current offset.
    pub(crate) fn rewind_to(&self, offset: usize) {
        let mut inner = self.inner.borrow_mut();
        debug_assert!(offset <= inner.offset, "cannot rewind forward");
        inner.offset = offset;
        inner.last_ptr = std::ptr::null_mut();
        inner.last_offset = offset;
    }

    /// Fill a committed span with a poison pattern.
    #[allow(dead_code)]
    pub(crate) fn poison_span(&self, offset: usize, len: usize, pattern: u8) {
        let inner = self.inner.borrow();
        debug_assert!(offset + len <= inner.commit_size);
        // SAFETY: the span is committed and inside the reservation.
        unsafe { std::ptr::write_bytes(inner.base.add(offset), pattern, len) };
    }
}

impl Inner {
    /// Ensure at least `target` bytes are committed. `target` is clamped to
    /// the reservation; returns false once the reservation is exhausted.
    fn commit_to(&mut self, target: usize) -> bool {
        if target <= self.commit_size {
            return true;
        }
        if target > self.reserve_size {
            return false;
        }
        let new_commit = align_up(target, self.page_size).min(self.reserve_size);
        // SAFETY: [base+commit_size, base+new_commit) lies inside the reservation.
        let ok = unsafe {
            backend::commit(self.base.add(self.commit_size), new_commit - self.commit_size)
        };
        if ok {
            self.commit_size = new_commit;
        }
        ok
    }

    fn bump(&mut self, size: usize, align: usize) -> *mut u8 {
        let align = effective_align(align);
        let start = align_up(self.offset, align);
        let end = match start.checked_add(size) {
            Some(e) => e,
            None => return std::ptr::null_mut(),
        };
        if !self.commit_to(end) {
            oom_notify(size);
            return std::ptr::null_mut();
        }
        // SAFETY: the span [start, end) is committed and inside the reservation.
        let ptr = unsafe { self.base.add(start) };
        self.last_offset = self.offset;
        self.last_ptr = ptr;
        self.offset = end;
        ptr
    }
}

impl Allocator for BumpAlloc {
    fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.borrow_mut().bump(layout.size(), layout.align())
    }

    fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.inner.borrow_mut().bump(new_size, old_layout.align());
        }

        let mut inner = self.inner.borrow_mut();
        if ptr == inner.last_ptr {
            // Adjust the most recent allocation in place.
            let start = (ptr as usize) - (inner.base as usize);
            let end = match start.checked_add(new_size) {
                Some(e) => e,
                None => return std::ptr::null_mut(),
            };
            if !inner.commit_to(end) {
                oom_notify(new_size);
                return std::ptr::null_mut();
            }
            inner.offset = end;
            return ptr;
        }

        let new_ptr = inner.bump(new_size, old_layout.align());
        if !new_ptr.is_null() {
            // SAFETY: both regions are live inside the arena and do not overlap
            // (the new block starts past the old allocation's end).
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, new_ptr, old_layout.size().min(new_size));
            }
        }
        new_ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut inner = self.inner.borrow_mut();
        if !ptr.is_null() && ptr == inner.last_ptr {
            inner.offset = inner.last_offset;
            inner.last_ptr = std::ptr::null_mut();
        }
        // Any other pointer is reclaimed by reset() or drop.
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Bump
    }
}

impl Drop for BumpAlloc {
    fn drop(&mut self) {
        let inner = self.inner.borrow();
        // SAFETY: base/reserve_size came from backend::reserve in new().
        unsafe { backend::release(inner.base, inner.reserve_size) };
    }
}

#[cfg(unix)]
mod backend {
    //! Reserve address space with PROT_NONE and flip page protections to
    //! commit. Decommit happens wholesale on release.

    pub fn reserve(size: usize) -> Option<*mut u8> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr as *mut u8)
        }
    }

    /// # Safety
    /// `[ptr, ptr+size)` must lie inside a reservation from [`reserve`].
    pub unsafe fn commit(ptr: *mut u8, size: usize) -> bool {
        libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) == 0
    }

    /// # Safety
    /// `[ptr, ptr+size)` must be a committed span inside a reservation.
    pub unsafe fn decommit(ptr: *mut u8, size: usize) {
        libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED);
        libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE);
    }

    /// # Safety
    /// `ptr`/`size` must describe a whole reservation from [`reserve`].
    pub unsafe fn release(ptr: *mut u8, size: usize) {
        if !ptr.is_null() {
            libc::munmap(ptr as *mut libc::c_void, size);
        }
    }
}

#[cfg(not(unix))]
mod backend {
    //! Fallback without virtual-memory control: the full range is committed
    //! from the system heap at reservation time.

    use std::alloc::Layout;

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, crate::alloc::MIN_ALIGN).expect("bump reservation layout")
    }

    pub fn reserve(size: usize) -> Option<*mut u8> {
        // SAFETY: non-zero size, valid layout.
        let ptr = unsafe { std::alloc::alloc(layout(size)) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    pub unsafe fn commit(_ptr: *mut u8, _size: usize) -> bool {
        true
    }

    pub unsafe fn decommit(_ptr: *mut u8, _size: usize) {}

    pub unsafe fn release(ptr: *mut u8, size: usize) {
        if !ptr.is_null() {
            std::alloc::dealloc(ptr, layout(size));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::size::mb;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn test_commit_on_demand() {
        let bump = BumpAlloc::new(mb(4), kb(64)).unwrap();
        assert_eq!(bump.committed_size(), 0);

        let ptr = bump.alloc(layout(100, 16));
        assert!(!ptr.is_null());
        assert_eq!(bump.committed_size(), kb(64));
        assert_eq!(bump.allocated_size(), 100);

        // Writes inside the committed prefix must be valid.
        unsafe { std::ptr::write_bytes(ptr, 0x77, 100) };
    }

    #[test]
    fn test_last_alloc_rewind() {
        let bump = BumpAlloc::with_reserve(mb(1)).unwrap();
        let before = bump.allocated_size();
        let p = bump.alloc(layout(40, 16));
        unsafe { bump.dealloc(p, layout(40, 16)) };
        assert_eq!(bump.allocated_size(), before);
    }

    #[test]
    fn test_non_last_free_is_noop() {
        let bump = BumpAlloc::with_reserve(mb(1)).unwrap();
        let p = bump.alloc(layout(32, 16));
        let _q = bump.alloc(layout(32, 16));
        let offset = bump.allocated_size();
        unsafe { bump.dealloc(p, layout(32, 16)) };
        assert_eq!(bump.allocated_size(), offset);
    }

    #[test]
    fn test_realloc_last_in_place() {
        let bump = BumpAlloc::with_reserve(mb(1)).unwrap();
        let p = bump.alloc(layout(64, 16));
        let grown = bump.realloc(p, layout(64, 16), 128);
        assert_eq!(p, grown);
        assert_eq!(bump.allocated_size(), 128);
    }

    #[test]
    fn test_realloc_non_last_copies() {
        let bump = BumpAlloc::with_reserve(mb(1)).unwrap();
        let p = bump.alloc(layout(8, 8));
        unsafe { std::ptr::write_bytes(p, 0x11, 8) };
        let _q = bump.alloc(layout(8, 8));
        let moved = bump.realloc(p, layout(8, 8), 16);
        assert_ne!(p, moved);
        unsafe {
            for i in 0..8 {
                assert_eq!(*moved.add(i), 0x11);
            }
        }
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let bump = BumpAlloc::new(kb(64), kb(64)).unwrap();
        let p = bump.alloc(layout(kb(64), 16));
        assert!(!p.is_null());
        let q = bump.alloc(layout(1, 1));
        assert!(q.is_null());
    }

    #[test]
    fn test_reset_keeps_commit() {
        let bump = BumpAlloc::new(mb(1), kb(64)).unwrap();
        let _ = bump.alloc(layout(kb(100), 16));
        let committed = bump.committed_size();
        bump.reset();
        assert_eq!(bump.allocated_size(), 0);
        assert_eq!(bump.committed_size(), committed);
    }
}
