//! The allocation entry points.
//!
//! There are six explicit ones, in single block and array flavours. Memory
//! from an array entry point must go back through an array entry point.
//! [`DebugAlloc`] plugs the same machinery in as the process allocator, so
//! every `Box`, `Vec` and `String` is tracked as a single block.
//!
//! Every entry point runs the debugger with the current thread marked as
//! inside it (see [`internal`]). The debugger's own allocations therefore
//! never reach the registry.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{
    alloc::{internal, record::AllocKind},
    error::AllocError,
    lifecycle::debugger,
    os::mem::{MmapPages, PageAllocator, PAGE_SIZE},
};

#[inline(always)]
fn allocate(size: usize, kind: AllocKind) -> Result<NonNull<u8>, AllocError> {
    internal::enter(|| match debugger() {
        Some(debugger) => {
            let origin = debugger.call_site();
            debugger.allocate(size, kind, origin)
        }
        // torn down: hand out plain pages
        None => MmapPages
            .allocate(size)
            .ok_or(AllocError::OutOfPages { size }),
    })
}

fn allocate_layout(layout: Layout) -> Result<NonNull<u8>, AllocError> {
    let page_size = *PAGE_SIZE;
    if layout.align() > page_size {
        return Err(AllocError::Alignment {
            align: layout.align(),
            page_size,
        });
    }
    allocate(layout.size(), AllocKind::SingleBlock)
}

/// Release `ptr` and escalate if that was illegal. `untracked_size` is what
/// to unmap if the debugger is already gone, `None` if we don't know.
#[inline(always)]
unsafe fn release(ptr: *mut u8, kind: AllocKind, byte_size: usize, untracked_size: Option<usize>) {
    if ptr.is_null() {
        return;
    }
    internal::enter(|| match debugger() {
        Some(debugger) => {
            let origin = debugger.call_site();
            // SAFETY: forwarded from the caller
            if let Err(anomaly) = unsafe { debugger.release(ptr, kind, byte_size, origin) } {
                debugger.config().on_anomaly.escalate(&anomaly);
            }
        }
        None => match (NonNull::new(ptr), untracked_size) {
            // SAFETY: after teardown every pointer we see came from
            // `MmapPages`, with the layout the caller passes back
            (Some(ptr), Some(size)) => unsafe { MmapPages.free(ptr, size) },
            _ => log::debug!("leaking {ptr:p}, freed after teardown without a size"),
        },
    })
}

/// Allocate `size` bytes for a single object.
///
/// The memory is page aligned and zeroed. Fails if `size` is above the
/// configured ceiling or the page allocator is out of memory.
#[inline(never)]
pub fn new_single(size: usize) -> Result<NonNull<u8>, AllocError> {
    allocate(size, AllocKind::SingleBlock)
}

/// Like [`new_single()`], but returns null instead of an error
#[inline(never)]
pub fn new_single_nothrow(size: usize) -> *mut u8 {
    allocate(size, AllocKind::SingleBlock).map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Allocate `size` bytes for an array. Free it with [`delete_array()`].
#[inline(never)]
pub fn new_array(size: usize) -> Result<NonNull<u8>, AllocError> {
    allocate(size, AllocKind::Array)
}

#[inline(never)]
pub fn new_array_nothrow(size: usize) -> *mut u8 {
    allocate(size, AllocKind::Array).map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Free a single block. Null is ignored. Anything else that is not a live
/// single block allocation is reported and escalated.
///
/// # Safety
///
/// If `ptr` is a live allocation it is freed and must not be used again.
#[inline(never)]
pub unsafe fn delete_single(ptr: *mut u8) {
    unsafe { release(ptr, AllocKind::SingleBlock, 0, None) }
}

/// # Safety
///
/// See [`delete_single()`]
#[inline(never)]
pub unsafe fn delete_single_sized(ptr: *mut u8, size: usize) {
    unsafe { release(ptr, AllocKind::SingleBlock, size, Some(size)) }
}

/// # Safety
///
/// See [`delete_single()`]
#[inline(never)]
pub unsafe fn delete_array(ptr: *mut u8) {
    unsafe { release(ptr, AllocKind::Array, 0, None) }
}

/// # Safety
///
/// See [`delete_single()`]
#[inline(never)]
pub unsafe fn delete_array_sized(ptr: *mut u8, size: usize) {
    unsafe { release(ptr, AllocKind::Array, size, Some(size)) }
}

/// The process allocator that puts every Rust heap allocation under the
/// debugger.
///
/// ```rust,no_run
/// #[global_allocator]
/// static GLOBAL: heapdbg::DebugAlloc = heapdbg::DebugAlloc;
/// ```
///
/// Each allocation gets its own pages, so expect it to be slow and memory
/// hungry. Alignments above the page size are refused.
pub struct DebugAlloc;

unsafe impl GlobalAlloc for DebugAlloc {
    #[inline(never)]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if internal::is_active() {
            return unsafe { internal::alloc(layout) };
        }
        allocate_layout(layout).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if internal::is_active() {
            return unsafe { internal::alloc_zeroed(layout) };
        }
        // fresh pages are already zeroed
        unsafe { self.alloc(layout) }
    }

    #[inline(never)]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if internal::owns(ptr) {
            return unsafe { internal::dealloc(ptr, layout) };
        }
        if internal::is_active() {
            // Debugger code dropping tracked memory. Going through the
            // registry here could take a lock we already hold, so the block
            // stays mapped and is reported as a leak.
            return;
        }
        unsafe { release(ptr, AllocKind::SingleBlock, layout.size(), Some(layout.size())) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if internal::owns(ptr) {
            return unsafe { internal::realloc(ptr, layout, new_size) };
        }
        // SAFETY: the caller guarantees `new_size` is valid for this alignment
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new = unsafe { self.alloc(new_layout) };
        if !new.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_aligned_layouts_are_refused() {
        let align = *PAGE_SIZE * 2;
        let layout = Layout::from_size_align(8, align).unwrap();
        assert_eq!(
            allocate_layout(layout),
            Err(AllocError::Alignment {
                align,
                page_size: *PAGE_SIZE
            })
        );
        assert!(unsafe { DebugAlloc.alloc(layout) }.is_null());
    }

    #[test]
    fn internal_context_uses_the_internal_heap() {
        let layout = Layout::from_size_align(24, 8).unwrap();
        internal::enter(|| unsafe {
            let ptr = DebugAlloc.alloc_zeroed(layout);
            assert!(internal::owns(ptr));
            assert_eq!(*ptr.add(23), 0);
            let ptr = DebugAlloc.realloc(ptr, layout, 48);
            assert!(internal::owns(ptr));
            DebugAlloc.dealloc(ptr, Layout::from_size_align(48, 8).unwrap());
        });
    }

    #[test]
    fn null_deletes_never_reach_the_debugger() {
        unsafe {
            delete_single(ptr::null_mut());
            delete_array_sized(ptr::null_mut(), 16);
        }
    }
}
