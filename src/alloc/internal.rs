//! The debugger's own heap.
//!
//! The registry, the reporter, symbolisation and logging all allocate. If
//! those allocations went through the tracked path we would recurse forever
//! (and deadlock on the registry lock long before that). So while a thread is
//! inside the debugger, every allocation it makes is served by a private
//! `dlmalloc` instance whose segments are carved out of a single
//! `MAP_NORESERVE` arena. Because the arena is one contiguous range, any
//! pointer can be classified as "ours" with two comparisons, no matter which
//! thread or context eventually frees it.

use std::{
    alloc::Layout,
    cell::{Cell, UnsafeCell},
    ptr,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use dlmalloc::Dlmalloc;

use crate::{
    os::mem::{MmapRegion, PAGE_SIZE},
    util::{hint::cold, num::round_up},
};

/// Address space reserved for the internal heap. Nothing is committed until
/// it is touched.
#[cfg(target_pointer_width = "64")]
const ARENA_RESERVE: usize = 1 << 34;
#[cfg(not(target_pointer_width = "64"))]
const ARENA_RESERVE: usize = 1 << 28;

/// We halve the reservation on failure (e.g. strict overcommit), down to this
const ARENA_MIN_RESERVE: usize = 1 << 26;

static ARENA_START: AtomicUsize = AtomicUsize::new(0);
static ARENA_END: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static INSIDE: Cell<bool> = const { Cell::new(false) };
}

/// `true` if the current thread is executing debugger code
#[inline]
pub fn is_active() -> bool {
    INSIDE.try_with(Cell::get).unwrap_or(false)
}

/// Run `f` with the current thread marked as inside the debugger. Nests.
#[inline]
pub fn enter<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(bool);

    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0;
            let _ = INSIDE.try_with(|inside| inside.set(prev));
        }
    }

    let _restore = Restore(INSIDE.try_with(|inside| inside.replace(true)).unwrap_or(false));
    f()
}

/// `true` if `ptr` was handed out by the internal heap
#[inline]
pub fn owns(ptr: *const u8) -> bool {
    let addr = ptr as usize;
    let start = ARENA_START.load(Ordering::Acquire);
    start != 0 && addr >= start && addr < ARENA_END.load(Ordering::Acquire)
}

/// The system allocator `dlmalloc` sits on: a bump pointer over the arena.
/// Segments are never returned, the arena only grows.
struct ArenaPages {
    next: AtomicUsize,
}

impl ArenaPages {
    const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }

    fn reserve() -> bool {
        if ARENA_START.load(Ordering::Acquire) != 0 {
            return true;
        }
        cold(|| {
            let mut size = ARENA_RESERVE;
            while size >= ARENA_MIN_RESERVE {
                if let Some(region) = MmapRegion::map_noreserve(size) {
                    let (start, len) = region.leak();
                    ARENA_END.store(start + len, Ordering::Release);
                    ARENA_START.store(start, Ordering::Release);
                    return true;
                }
                size /= 2;
            }
            false
        })
    }
}

// SAFETY: every segment is page aligned, zeroed (fresh anonymous memory), and
// handed out at most once
unsafe impl dlmalloc::Allocator for ArenaPages {
    fn alloc(&self, size: usize) -> (*mut u8, usize, u32) {
        if !Self::reserve() {
            return (ptr::null_mut(), 0, 0);
        }
        let size = round_up(size, *PAGE_SIZE);
        let start = ARENA_START.load(Ordering::Acquire);
        let end = ARENA_END.load(Ordering::Acquire);
        let offset = self.next.load(Ordering::Relaxed);
        if end - start - offset < size {
            return (ptr::null_mut(), 0, 0);
        }
        self.next.store(offset + size, Ordering::Relaxed);
        ((start + offset) as *mut u8, size, 0)
    }

    fn remap(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize, _can_move: bool) -> *mut u8 {
        ptr::null_mut()
    }

    fn free_part(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize) -> bool {
        false
    }

    fn free(&self, _ptr: *mut u8, _size: usize) -> bool {
        false
    }

    fn can_release_part(&self, _flags: u32) -> bool {
        false
    }

    fn allocates_zeros(&self) -> bool {
        true
    }

    fn page_size(&self) -> usize {
        *PAGE_SIZE
    }
}

/// A spin lock around the `dlmalloc` state. We can't use a parking lock here:
/// parking may allocate, and allocating is what we're in the middle of.
struct InternalHeap {
    locked: AtomicBool,
    heap: UnsafeCell<Option<Dlmalloc<ArenaPages>>>,
}

// SAFETY: `heap` is only touched through `HeapLock`, which is exclusive
unsafe impl Sync for InternalHeap {}

struct HeapLock<'a> {
    heap: &'a InternalHeap,
}

impl<'a> HeapLock<'a> {
    fn new(heap: &'a InternalHeap) -> Self {
        while heap
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        Self { heap }
    }

    #[allow(clippy::mut_from_ref)]
    fn dlmalloc(&self) -> &mut Dlmalloc<ArenaPages> {
        // SAFETY: we hold the lock, so this is the only reference
        let heap = unsafe { &mut *self.heap.heap.get() };
        heap.get_or_insert_with(|| Dlmalloc::new_with_allocator(ArenaPages::new()))
    }
}

impl Drop for HeapLock<'_> {
    fn drop(&mut self) {
        self.heap.locked.store(false, Ordering::Release);
    }
}

static HEAP: InternalHeap = InternalHeap {
    locked: AtomicBool::new(false),
    heap: UnsafeCell::new(None),
};

/// # Safety
///
/// Same contract as [`std::alloc::GlobalAlloc::alloc()`]
pub unsafe fn alloc(layout: Layout) -> *mut u8 {
    let lock = HeapLock::new(&HEAP);
    unsafe { lock.dlmalloc().malloc(layout.size(), layout.align()) }
}

/// # Safety
///
/// Same contract as [`std::alloc::GlobalAlloc::alloc_zeroed()`]
pub unsafe fn alloc_zeroed(layout: Layout) -> *mut u8 {
    let lock = HeapLock::new(&HEAP);
    unsafe { lock.dlmalloc().calloc(layout.size(), layout.align()) }
}

/// # Safety
///
/// `ptr` must satisfy [`owns()`] and have been allocated with `layout`
pub unsafe fn dealloc(ptr: *mut u8, layout: Layout) {
    debug_assert!(owns(ptr));
    let lock = HeapLock::new(&HEAP);
    unsafe { lock.dlmalloc().free(ptr, layout.size(), layout.align()) }
}

/// # Safety
///
/// Same contract as [`std::alloc::GlobalAlloc::realloc()`], and `ptr` must
/// satisfy [`owns()`]
pub unsafe fn realloc(ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    debug_assert!(owns(ptr));
    let lock = HeapLock::new(&HEAP);
    unsafe {
        lock.dlmalloc()
            .realloc(ptr, layout.size(), layout.align(), new_size)
    }
}
