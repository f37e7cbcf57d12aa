//! Scoped temp allocation.
//!
//! Every thread owns a lazily-created temp arena: a virtual-memory bump range
//! committed on growth. [`TempScope::push`] opens a frame and returns a guard;
//! allocations advance the arena offset and the guard's drop (or an explicit,
//! id-checked [`TempScope::pop`]) rewinds it. Holding a pointer past the
//! matching pop is a usage error; with the `debug` feature the freed span is
//! poisoned to surface such bugs.
//!
//! Arenas are strictly thread-local. Never hand temp pointers to another
//! thread.

use std::alloc::Layout;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::size::{kb, mb};

use super::bump::BumpAlloc;
use super::{effective_align, Allocator};

/// Address space reserved per thread arena.
const ARENA_RESERVE: usize = mb(256);
/// Commit granularity for thread arenas.
const ARENA_PAGE_SIZE: usize = kb(64);
/// Committed memory is kept at least this large once the arena has been used.
const MIN_COMMIT_TARGET: usize = kb(64);
/// Seconds of inactivity before committed pages decay toward the peak target.
const DECAY_SECONDS: f32 = 2.0;

/// Pattern written over popped frame memory with the `debug` feature.
#[cfg(feature = "debug")]
pub const FREED_PATTERN: u8 = 0xCD;

/// Per-thread peak statistics, readable from any thread.
pub struct TempStats {
    /// Peak offset observed since the last idle decay.
    pub current_peak: usize,
    /// Highest offset ever observed on this thread.
    pub max_peak: usize,
    /// The owning thread's name at arena creation.
    pub thread_name: String,
}

struct SharedStats {
    current_peak: AtomicUsize,
    max_peak: AtomicUsize,
    thread_name: String,
}

static STATS_REGISTRY: Mutex<Vec<Arc<SharedStats>>> = Mutex::new(Vec::new());

struct Frame {
    id: u32,
    saved_offset: usize,
}

struct TempArena {
    bump: BumpAlloc,
    frames: Vec<Frame>,
    next_id: u32,
    idle_time: f32,
    used_since_decay: bool,
    stats: Arc<SharedStats>,
    #[cfg(feature = "debug")]
    capture_callstacks: bool,
    #[cfg(feature = "debug")]
    callstacks: Vec<backtrace::Backtrace>,
}

thread_local! {
    static ARENA: RefCell<Option<TempArena>> = const { RefCell::new(None) };
}

impl TempArena {
    fn new() -> Self {
        let stats = Arc::new(SharedStats {
            current_peak: AtomicUsize::new(0),
            max_peak: AtomicUsize::new(0),
            thread_name: std::thread::current().name().unwrap_or("<unnamed>").to_string(),
        });
        STATS_REGISTRY.lock().push(stats.clone());
        Self {
            bump: BumpAlloc::new(ARENA_RESERVE, ARENA_PAGE_SIZE).expect("temp arena reservation"),
            frames: Vec::new(),
            next_id: 1,
            idle_time: 0.0,
            used_since_decay: false,
            stats,
            #[cfg(feature = "debug")]
            capture_callstacks: false,
            #[cfg(feature = "debug")]
            callstacks: Vec::new(),
        }
    }

    fn record_peak(&self) {
        let offset = self.bump.allocated_size();
        self.stats.current_peak.fetch_max(offset, Ordering::Relaxed);
        self.stats.max_peak.fetch_max(offset, Ordering::Relaxed);
    }
}

fn with_arena<F, R>(f: F) -> R
where
    F: FnOnce(&mut TempArena) -> R,
{
    ARENA.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let arena = borrow.get_or_insert_with(TempArena::new);
        f(arena)
    })
}

/// A temp frame on the calling thread's arena.
///
/// Dropping the scope rewinds the arena to where it was at [`TempScope::push`].
/// Scopes must be dropped in strict LIFO order, which the borrow checker does
/// not enforce across siblings; the pop asserts the frame id to catch misuse.
pub struct TempScope {
    id: u32,
    // Arenas are thread-local; keep the scope on its thread.
    _not_send: PhantomData<*const ()>,
}

impl TempScope {
    /// Open a new temp frame and return its guard.
    pub fn push() -> Self {
        let id = with_arena(|arena| {
            let id = arena.next_id;
            arena.next_id += 1;
            arena.used_since_decay = true;
            arena.frames.push(Frame {
                id,
                saved_offset: arena.bump.allocated_size(),
            });
            id
        });
        Self {
            id,
            _not_send: PhantomData,
        }
    }

    /// This frame's id (a per-thread depth marker).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Allocate from the frame. Returns null when the arena reservation is
    /// exhausted.
    pub fn alloc(&self, layout: Layout) -> *mut u8 {
        with_arena(|arena| {
            let layout = Layout::from_size_align(
                layout.size(),
                effective_align(layout.align()),
            )
            .expect("temp layout");
            let ptr = arena.bump.alloc(layout);
            if !ptr.is_null() {
                arena.record_peak();
                #[cfg(feature = "debug")]
                if arena.capture_callstacks {
                    arena.callstacks.push(backtrace::Backtrace::new_unresolved());
                }
            }
            ptr
        })
    }

    /// Allocate zeroed memory for `count` values of `T`.
    pub fn alloc_slice<T>(&self, count: usize) -> *mut T {
        let layout = match Layout::array::<T>(count) {
            Ok(l) => l,
            Err(_) => return std::ptr::null_mut(),
        };
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            // SAFETY: freshly allocated span of layout.size() bytes.
            unsafe { std::ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr as *mut T
    }

    /// Explicitly close the frame. Equivalent to dropping the scope.
    pub fn pop(self) {
        // Drop does the work.
    }
}

impl Drop for TempScope {
    fn drop(&mut self) {
        with_arena(|arena| {
            let frame = arena.frames.pop().expect("temp frame stack underflow");
            assert_eq!(
                frame.id, self.id,
                "temp frames must be popped in push order"
            );
            arena.record_peak();

            #[cfg(feature = "debug")]
            arena.callstacks.clear();

            rewind_to(arena, frame.saved_offset);
        });
    }
}

#[cfg(feature = "debug")]
fn rewind_to(arena: &mut TempArena, saved_offset: usize) {
    let offset = arena.bump.allocated_size();
    if offset > saved_offset {
        arena.bump.poison_span(saved_offset, offset - saved_offset, FREED_PATTERN);
    }
    arena.bump.rewind_to(saved_offset);
}

#[cfg(not(feature = "debug"))]
fn rewind_to(arena: &mut TempArena, saved_offset: usize) {
    arena.bump.rewind_to(saved_offset);
}

/// Current offset of the calling thread's arena. Zero when no frame has
/// allocated.
pub fn offset() -> usize {
    with_arena(|arena| arena.bump.allocated_size())
}

/// Depth of the calling thread's frame stack.
pub fn depth() -> usize {
    with_arena(|arena| arena.frames.len())
}

/// Per-frame maintenance, called once per frame by the engine harness.
///
/// When the calling thread's arena has been idle (no frames opened since the
/// last decay window), committed pages decay toward the recent peak so a
/// one-off spike does not pin memory forever.
pub fn reset(dt: f32) {
    with_arena(|arena| {
        debug_assert!(
            arena.frames.is_empty(),
            "temp frames must not span engine frames"
        );
        if arena.used_since_decay {
            arena.used_since_decay = false;
            arena.idle_time = 0.0;
            return;
        }

        arena.idle_time += dt;
        if arena.idle_time >= DECAY_SECONDS {
            let peak = arena.stats.current_peak.swap(0, Ordering::Relaxed);
            let target = peak.max(MIN_COMMIT_TARGET);
            arena.bump.decommit_to(target);
            arena.idle_time = 0.0;
        }
    });
}

/// Enable call-stack capture for every temp allocation on this thread.
#[cfg(feature = "debug")]
pub fn enable_callstack_capture(enable: bool) {
    with_arena(|arena| arena.capture_callstacks = enable);
}

/// Snapshot peak statistics for every thread arena created so far.
pub fn stats() -> Vec<TempStats> {
    STATS_REGISTRY
        .lock()
        .iter()
        .map(|s| TempStats {
            current_peak: s.current_peak.load(Ordering::Relaxed),
            max_peak: s.max_peak.load(Ordering::Relaxed),
            thread_name: s.thread_name.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 16).unwrap()
    }

    #[test]
    fn test_scope_rewinds_offset() {
        let before = offset();
        {
            let scope = TempScope::push();
            let p = scope.alloc(layout(100));
            assert!(!p.is_null());
            assert!(offset() > before);
        }
        assert_eq!(offset(), before);
    }

    #[test]
    fn test_nested_scopes() {
        let base = offset();
        let outer = TempScope::push();
        let _a = outer.alloc(layout(64));
        let after_outer = offset();
        {
            let inner = TempScope::push();
            let _b = inner.alloc(layout(256));
            assert!(offset() > after_outer);
        }
        assert_eq!(offset(), after_outer);
        drop(outer);
        assert_eq!(offset(), base);
    }

    #[test]
    fn test_peak_tracks_maximum() {
        {
            let scope = TempScope::push();
            let _ = scope.alloc(layout(kb(8)));
        }
        let local_max = stats()
            .iter()
            .map(|s| s.max_peak)
            .max()
            .unwrap_or(0);
        assert!(local_max >= kb(8));
    }

    #[test]
    fn test_alloc_slice_zeroed() {
        let scope = TempScope::push();
        let p = scope.alloc_slice::<u64>(32);
        assert!(!p.is_null());
        unsafe {
            for i in 0..32 {
                assert_eq!(*p.add(i), 0);
            }
        }
    }

    #[test]
    fn test_reset_when_idle_is_safe() {
        // No frames active: reset must not disturb the (empty) arena.
        reset(1.0);
        reset(5.0);
        assert_eq!(depth(), 0);
    }
}
