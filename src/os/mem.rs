use std::{
    ptr::{self, NonNull},
    sync::LazyLock,
};

use libc::{
    mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE,
};

use crate::util::{hint::cold, num::round_up};

pub(crate) static PAGE_SIZE: LazyLock<usize> = LazyLock::new(page_size::get);

/// Raw, page-granular memory. Tracked allocations are served from here, one
/// mapping per allocation, so that every block starts on a fresh page.
///
/// # Safety
///
/// - `allocate()` must return memory that is aligned to `page_size()`, valid
///   for reads and writes of `size` bytes, and not handed out again until it
///   has been passed to `free()`.
pub unsafe trait PageAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have come from `allocate(size)` on this allocator and must
    /// not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);

    fn page_size(&self) -> usize;
}

/// `mmap()` `size` bytes (rounded up to whole pages, at least one) of
/// anonymous read/write memory. Must not log or allocate: this runs
/// underneath the internal heap.
fn map_anonymous(size: usize, extra_flags: i32) -> Option<NonNull<u8>> {
    let size = round_up(size.max(1), *PAGE_SIZE);
    // SAFETY: anonymous private mapping at a kernel-chosen address; touches no
    // existing memory
    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_ANONYMOUS | MAP_PRIVATE | extra_flags,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return cold(|| None);
    }
    NonNull::new(ptr as *mut u8)
}

/// One anonymous mapping per allocation, released with `munmap()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapPages;

// SAFETY: `mmap()` returns page aligned, zeroed, exclusively owned memory
unsafe impl PageAllocator for MmapPages {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        map_anonymous(size, 0)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY:
        // - The address must be a multiple of the page size (but length need
        //   not be). Guaranteed because it came from `map_anonymous()`.
        // - All pages containing a part of the range are unmapped, which is
        //   exactly the mapping `allocate(size)` made.
        unsafe {
            munmap(ptr.as_ptr() as _, round_up(size.max(1), *PAGE_SIZE));
        }
    }

    fn page_size(&self) -> usize {
        *PAGE_SIZE
    }
}

/// A large `MAP_NORESERVE` region that is never unmapped. Nothing is committed
/// until it is touched, so reserving generously is cheap.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

impl MmapRegion {
    pub fn map_noreserve(size: usize) -> Option<MmapRegion> {
        let ptr = map_anonymous(size, MAP_NORESERVE)?;
        Some(MmapRegion {
            ptr,
            size: round_up(size.max(1), *PAGE_SIZE),
        })
    }

    pub fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.size
    }

    /// Give up ownership; the mapping lives for the rest of the process
    pub fn leak(self) -> (usize, usize) {
        let region = std::mem::ManuallyDrop::new(self);
        (region.start(), region.len())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: we mapped exactly `self.size` bytes at `self.ptr` and never
        // shrank the mapping
        unsafe {
            munmap(self.ptr.as_ptr() as _, self.size);
        }
    }
}
