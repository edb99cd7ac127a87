//! The general purpose heaps that [`InstrumentedAlloc`] sits on top of.
//!
//! These do no bookkeeping of their own. Every request that reaches a
//! [`RawHeap`] already includes room for the block header.
//!
//! [`InstrumentedAlloc`]: super::InstrumentedAlloc

use std::{
    alloc::{GlobalAlloc, Layout, System},
    ptr::{self, NonNull},
};

use dlmalloc::GlobalDlmalloc;

use crate::util::hint::cold;

/// The alignment that `malloc()` gives us for free on every platform we care
/// about. Anything above this needs an aligned allocation call.
pub const MALLOC_MIN_ALIGN: usize = 2 * std::mem::size_of::<usize>();

/// A raw block allocator.
///
/// # Safety
///
/// - `alloc()` and `realloc()` must return blocks valid for reads and writes
///   of at least `layout.size()` bytes, aligned to at least `layout.align()`
/// - `realloc()` must preserve the first `min(old.size(), new_size)` bytes
///   and must leave the original block untouched if it returns `None`
pub unsafe trait RawHeap {
    /// Allocate an uninitialized block. `None` means out of memory.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Grow or shrink a block, keeping the same alignment.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block from this heap that was allocated (or last
    /// reallocated) with `old`.
    unsafe fn realloc(&self, ptr: NonNull<u8>, old: Layout, new_size: usize)
        -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must be a live block from this heap that was allocated (or last
    /// reallocated) with `layout`. It must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Plain `malloc()`/`realloc()`/`free()` from the C library.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHeap;

#[cfg(unix)]
impl LibcHeap {
    fn memalign(layout: Layout) -> *mut u8 {
        let mut out = ptr::null_mut();
        // posix_memalign() wants a multiple of sizeof(void *)
        let align = layout.align().max(std::mem::size_of::<usize>());
        // SAFETY: `out` is a valid place to write a pointer, and `align` is a
        // power of two (from `Layout`) that is at least sizeof(void *)
        let rc = unsafe { libc::posix_memalign(&mut out, align, layout.size()) };
        if rc == 0 {
            out as *mut u8
        } else {
            ptr::null_mut()
        }
    }
}

// SAFETY: malloc() returns blocks aligned to MALLOC_MIN_ALIGN, and we go
// through posix_memalign() for anything stricter. realloc() leaves the input
// alone when it fails.
#[cfg(unix)]
unsafe impl RawHeap for LibcHeap {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let data = if layout.align() <= MALLOC_MIN_ALIGN {
            // SAFETY: malloc() has no preconditions
            unsafe { libc::malloc(layout.size()) as *mut u8 }
        } else {
            cold(|| Self::memalign(layout))
        };
        NonNull::new(data)
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if old.align() <= MALLOC_MIN_ALIGN {
            // SAFETY: caller guarantees `ptr` came from malloc() on this heap
            let data = unsafe { libc::realloc(ptr.as_ptr() as _, new_size) };
            return NonNull::new(data as *mut u8);
        }
        // realloc() can't be trusted to keep an over-aligned block aligned
        cold(|| {
            let new_layout = Layout::from_size_align(new_size, old.align()).ok()?;
            let data = self.alloc(new_layout)?;
            // SAFETY: both blocks are live and distinct, and each is at least
            // `min(old, new)` bytes long
            unsafe {
                ptr::copy_nonoverlapping(ptr.as_ptr(), data.as_ptr(), old.size().min(new_size));
                self.free(ptr, old);
            }
            Some(data)
        })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _: Layout) {
        // SAFETY: identical contract to caller. posix_memalign() blocks are
        // released with free() as well.
        unsafe { libc::free(ptr.as_ptr() as _) }
    }
}

/// The Rust standard library's system allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHeap;

// SAFETY: delegates to `System`, which upholds the `GlobalAlloc` contract
unsafe impl RawHeap for SystemHeap {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: we never build zero-sized layouts, every request carries
        // at least a header
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: identical contract to caller
        NonNull::new(unsafe { System.realloc(ptr.as_ptr(), old, new_size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: identical contract to caller
        unsafe { System.dealloc(ptr.as_ptr(), layout) }
    }
}

/// Doug Lea's `dlmalloc()`, through the `dlmalloc` crate's global instance.
///
/// https://gee.cs.oswego.edu/dl/html/malloc.html
#[derive(Debug, Default, Clone, Copy)]
pub struct DlHeap;

// SAFETY: delegates to `GlobalDlmalloc`, which upholds the `GlobalAlloc`
// contract and serializes access to its heap internally
unsafe impl RawHeap for DlHeap {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: layouts are never zero-sized
        NonNull::new(unsafe { GlobalDlmalloc.alloc(layout) })
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: identical contract to caller
        NonNull::new(unsafe { GlobalDlmalloc.realloc(ptr.as_ptr(), old, new_size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: identical contract to caller
        unsafe { GlobalDlmalloc.dealloc(ptr.as_ptr(), layout) }
    }
}

/// The heap used when none is named: the C library's `malloc()` where there
/// is one.
#[cfg(unix)]
pub type DefaultHeap = LibcHeap;

#[cfg(not(unix))]
pub type DefaultHeap = SystemHeap;

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise<H: RawHeap>(heap: &H, align: usize) {
        let layout = Layout::from_size_align(24, align).unwrap();
        let data = heap.alloc(layout).expect("out of memory");
        assert_eq!(data.as_ptr() as usize % align, 0);
        unsafe {
            for i in 0..24 {
                data.as_ptr().add(i).write(i as u8);
            }
            let data = heap.realloc(data, layout, 4096).expect("out of memory");
            assert_eq!(data.as_ptr() as usize % align, 0);
            for i in 0..24 {
                assert_eq!(data.as_ptr().add(i).read(), i as u8);
            }
            heap.free(data, Layout::from_size_align(4096, align).unwrap());
        }
    }

    #[cfg(unix)]
    #[test]
    fn libc_heap_keeps_contents_across_realloc() {
        exercise(&LibcHeap, 16);
    }

    #[cfg(unix)]
    #[test]
    fn libc_heap_honours_large_alignment() {
        exercise(&LibcHeap, 64);
    }

    #[test]
    fn system_heap_keeps_contents_across_realloc() {
        exercise(&SystemHeap, 16);
    }

    #[test]
    fn dl_heap_keeps_contents_across_realloc() {
        exercise(&DlHeap, 16);
    }
}
