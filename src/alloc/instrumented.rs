//! A wrapper around a [`RawHeap`] that puts a [`BlockHeader`] in front of
//! every block.
//!
//! The header alone is enough to keep the counters right and to catch frees
//! of pointers that aren't (or are no longer) ours. In diagnostic mode every
//! live block is also recorded in a [`Registry`], together with where it was
//! allocated, so that whatever is still alive when the allocator goes away
//! can be listed one block at a time.
//!
//! ```
//! use tagheap::{alloc::InstrumentedAlloc, config::AllocConfig};
//!
//! let heap = InstrumentedAlloc::new(AllocConfig::diagnostic());
//! let block = heap.allocate_tagged(64, "Scratch").unwrap();
//! assert_eq!(heap.stats().bytes_live, 64);
//! unsafe { heap.free(block.as_ptr()).unwrap() };
//! assert!(!heap.leak_report().has_leaks());
//! ```

use std::{
    alloc::Layout,
    mem,
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard},
};

use log::{debug, error, info, trace, warn};

use super::{
    header::{slot_from_raw, BlockHeader, GuardTag, Provenance, BLOCK_ALIGN, HEADER_SIZE},
    raw::{DefaultHeap, RawHeap},
    registry::Registry,
    report::{LeakEntry, LeakReport},
    stats::{Stats, StatsSnapshot},
    tags::TagInterner,
};
use crate::{
    config::{AllocConfig, ENV_CONFIG},
    error::{AllocError, AllocOp},
    util::{hint::cold, num::kib},
};

/// A heap allocator that counts everything and, optionally, remembers every
/// live block so that leaks can be reported by call site.
///
/// There is no global instance. Build one per subsystem (or per test) and
/// pass it around.
pub struct InstrumentedAlloc<H = DefaultHeap>
where
    H: RawHeap,
{
    heap: H,
    config: AllocConfig,
    stats: Stats,
    /// Only present in diagnostic mode. The lock also serializes the raw
    /// allocation calls that go with each registry update.
    registry: Option<Mutex<Registry>>,
    tags: TagInterner,
    /// Set once the leak report has been emitted, so `Drop` doesn't repeat it
    reported: bool,
}

impl InstrumentedAlloc<DefaultHeap> {
    pub fn new(config: AllocConfig) -> Self {
        Self::with_heap(DefaultHeap::default(), config)
    }
}

impl Default for InstrumentedAlloc<DefaultHeap> {
    /// Configured from the environment, see [`crate::config`].
    fn default() -> Self {
        Self::new(*ENV_CONFIG)
    }
}

impl<H> InstrumentedAlloc<H>
where
    H: RawHeap,
{
    pub fn with_heap(heap: H, config: AllocConfig) -> Self {
        let registry = config.diagnostics.then(|| {
            Mutex::new(Registry::new(
                config.initial_registry_slots,
                config.registry_increment,
            ))
        });
        debug!(
            "instrumented allocator up (diagnostics: {}, header: {} bytes)",
            config.diagnostics, HEADER_SIZE
        );
        Self {
            heap,
            config,
            stats: Stats::new(),
            registry,
            tags: TagInterner::new(),
            reported: false,
        }
    }

    pub const fn config(&self) -> &AllocConfig {
        &self.config
    }

    pub fn is_diagnostic(&self) -> bool {
        self.registry.is_some()
    }

    /// Return the underlying heap
    pub const fn heap(&self) -> &H {
        &self.heap
    }

    fn lock_registry(&self) -> Option<MutexGuard<'_, Registry>> {
        // Nothing in a registry critical section can panic halfway through an
        // update, so a poisoned lock still guards a consistent table.
        self.registry
            .as_ref()
            .map(|registry| registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Allocate `size` uninitialized bytes, aligned to [`BLOCK_ALIGN`]. In
    /// diagnostic mode the caller's location is recorded.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_with(size, Provenance::caller(None))
    }

    /// [`InstrumentedAlloc::allocate`], with a category to show in leak
    /// reports.
    #[track_caller]
    pub fn allocate_tagged(
        &self,
        size: usize,
        type_tag: &'static str,
    ) -> Result<NonNull<u8>, AllocError> {
        self.allocate_with(size, Provenance::caller(Some(type_tag)))
    }

    /// [`InstrumentedAlloc::allocate`], but the block is zero-filled.
    #[track_caller]
    pub fn allocate_zeroed(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let data = self.allocate_with(size, Provenance::caller(None))?;
        // SAFETY: we just allocated `size` bytes at `data`
        unsafe { data.as_ptr().write_bytes(0, size) };
        Ok(data)
    }

    /// Room for `count` uninitialized `T`s, tagged with the name of `T`.
    #[track_caller]
    pub fn allocate_typed<T>(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        let align = mem::align_of::<T>();
        if align > BLOCK_ALIGN {
            return cold(|| {
                warn!("can't allocate a type aligned to {align} bytes");
                Err(AllocError::Misaligned { align })
            });
        }
        let size = mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(AllocError::OutOfMemory { size: usize::MAX })?;
        let type_tag = self.is_diagnostic().then(|| self.tags.type_tag::<T>());
        Ok(self.allocate_with(size, Provenance::caller(type_tag))?.cast())
    }

    /// Allocate with explicit provenance. Provenance is dropped unless the
    /// allocator is in diagnostic mode.
    pub fn allocate_with(
        &self,
        size: usize,
        provenance: Provenance,
    ) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return cold(|| {
                warn!("trying to allocate 0 bytes");
                Err(AllocError::ZeroSizeRequest)
            });
        }
        let layout = BlockHeader::raw_layout(size).ok_or_else(|| out_of_memory(size))?;

        let mut registry = self.lock_registry();
        let block = self.heap.alloc(layout).ok_or_else(|| out_of_memory(size))?;

        let mut header = BlockHeader::live(size, Provenance::empty());
        if let Some(registry) = registry.as_mut() {
            header.provenance = provenance;
            header.set_slot(Some(registry.insert(block)));
        }
        // SAFETY: the block is at least HEADER_SIZE bytes and suitably aligned
        unsafe { BlockHeader::in_block(block).as_ptr().write(header) };
        self.stats.record_alloc(size);
        drop(registry);

        let data = BlockHeader::payload_of(block);
        trace!("allocate({size}) -> {:#x}", data.as_ptr() as usize);
        Ok(data)
    }

    /// Look up the block behind `ptr`, making sure it's one of ours and still
    /// alive. In diagnostic mode the registry has to agree as well.
    ///
    /// # Safety
    ///
    /// Same as [`InstrumentedAlloc::free`].
    unsafe fn checked_block(
        &self,
        ptr: *mut u8,
        op: AllocOp,
        registry: Option<&Registry>,
    ) -> Result<(NonNull<u8>, NonNull<BlockHeader>), AllocError> {
        let Some(data) = NonNull::new(ptr) else {
            return cold(|| {
                warn!("trying to {op} null pointer");
                Err(AllocError::NullPointer { op })
            });
        };
        if data.as_ptr() as usize % BLOCK_ALIGN != 0 {
            return Err(unknown_memory(op, ptr, None));
        }
        // SAFETY: requirement passed to caller
        let block = unsafe { BlockHeader::block_of(data) };
        let header = BlockHeader::in_block(block);

        // The guard is read on its own first. Until it checks out, the rest
        // of the header might not even be a valid `BlockHeader`.
        // SAFETY: caller guarantees the header bytes are readable
        let guard = unsafe { ptr::addr_of!((*header.as_ptr()).guard).read() };
        let known = guard.is_live()
            && registry.map_or(true, |registry| {
                // SAFETY: the guard says this is a live header, and any bit
                // pattern is a valid `usize`
                let raw = unsafe { ptr::addr_of!((*header.as_ptr()).slot).read() };
                slot_from_raw(raw).is_some_and(|slot| registry.holds(slot, block))
            });
        if !known {
            return Err(unknown_memory(op, ptr, Some(guard)));
        }
        Ok((block, header))
    }

    /// Resize a block, keeping the first `min(old, new_size)` bytes. The
    /// block may move. On error the original block is left exactly as it
    /// was.
    ///
    /// In diagnostic mode a block that moves is registered again, and loses
    /// its provenance.
    ///
    /// # Safety
    ///
    /// Same as [`InstrumentedAlloc::free`]. If this returns `Ok`, `ptr` must
    /// not be used again.
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut registry = self.lock_registry();
        // SAFETY: requirement passed to caller
        let (block, header) =
            unsafe { self.checked_block(ptr, AllocOp::Reallocate, registry.as_deref())? };
        if new_size == 0 {
            return cold(|| {
                warn!("trying to realloc 0 bytes");
                Err(AllocError::ZeroSizeRequest)
            });
        }
        // SAFETY: checked above
        let old_size = unsafe { header.as_ref().size };
        let new_layout = BlockHeader::raw_layout(new_size).ok_or_else(|| out_of_memory(new_size))?;

        // If the block moves, the old header is left behind marked as freed,
        // so a stale pointer to it is caught like any other double free.
        // SAFETY: checked above
        unsafe { (*header.as_ptr()).guard = GuardTag::FREED };
        // SAFETY: the block is live, and was allocated with exactly this
        // layout. On failure the heap leaves it alone.
        let Some(new_block) =
            (unsafe { self.heap.realloc(block, raw_layout_of(old_size), new_layout.size()) })
        else {
            // SAFETY: still our block, untouched by the heap
            unsafe { (*header.as_ptr()).guard = GuardTag::LIVE };
            return Err(out_of_memory(new_size));
        };

        // SAFETY: realloc() moved the header along with everything else
        let header = unsafe { &mut *BlockHeader::in_block(new_block).as_ptr() };
        header.guard = GuardTag::LIVE;
        header.size = new_size;
        if new_block != block {
            header.provenance = Provenance::empty();
            if let Some(registry) = registry.as_mut() {
                if let Some(slot) = header.slot() {
                    registry.remove(slot);
                }
                header.set_slot(Some(registry.insert(new_block)));
            }
        }
        self.stats.record_realloc(old_size, new_size);
        drop(registry);

        let data = BlockHeader::payload_of(new_block);
        trace!(
            "reallocate({:#x}, {new_size}) -> {:#x}",
            ptr as usize,
            data.as_ptr() as usize
        );
        Ok(data)
    }

    /// Release a block. A null pointer, a pointer that was already freed, or
    /// a pointer that never came from this allocator is reported and
    /// otherwise ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or have been returned by this allocator. It may
    /// already have been freed, as long as the memory in front of it is still
    /// readable (the underlying heap hasn't given it back to the OS).
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), AllocError> {
        let mut registry = self.lock_registry();
        // SAFETY: requirement passed to caller
        let (block, header) =
            unsafe { self.checked_block(ptr, AllocOp::Free, registry.as_deref())? };
        // SAFETY: checked above, and nobody else touches headers while we
        // hold the registry (or, without diagnostics, while the caller owns
        // the block)
        let header = unsafe { &mut *header.as_ptr() };
        let size = header.size;
        if let (Some(registry), Some(slot)) = (registry.as_mut(), header.slot()) {
            registry.remove(slot);
        }
        header.guard = GuardTag::FREED;
        header.size = 0;
        header.set_slot(None);
        self.stats.record_free(size);

        // SAFETY: live block from this heap, allocated with this layout
        unsafe { self.heap.free(block, raw_layout_of(size)) };
        drop(registry);

        trace!("free({:#x}) released {size} bytes", ptr as usize);
        Ok(())
    }

    /// Zero the live byte/block counters and the high water mark, e.g. to
    /// measure one level load. Nothing is freed and the registry is left
    /// alone.
    pub fn reset(&self) {
        debug!("resetting allocator counters");
        self.stats.reset();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Everything that is still allocated right now. Without diagnostics only
    /// the counters are filled in.
    pub fn leak_report(&self) -> LeakReport {
        let registry = self.lock_registry();
        let stats = self.stats.snapshot();
        let entries: Vec<LeakEntry> = registry
            .as_deref()
            .map(|registry| registry.iter().map(leak_entry).collect())
            .unwrap_or_default();
        debug_assert_eq!(
            entries.len(),
            registry.as_deref().map_or(0, Registry::len)
        );
        LeakReport {
            stats,
            diagnostics: registry.is_some(),
            entries,
        }
    }

    fn emit_report(&mut self) -> LeakReport {
        let report = self.leak_report();
        self.reported = true;
        debug!("{} distinct type tags interned", self.tags.len());
        let stats = &report.stats;
        info!(
            "allocations: {}, reallocations: {}, high water mark: {} KiB",
            stats.allocations_total,
            stats.reallocations_total,
            kib(stats.high_water_mark)
        );
        if report.has_leaks() {
            warn!(
                "memory leak detected: {} bytes in {} blocks not released",
                stats.bytes_live, stats.allocations_live
            );
        }
        if !report.entries.is_empty() {
            warn!("memory leaks detected:");
            for entry in &report.entries {
                warn!("  {entry}");
            }
            warn!("dump complete ({} leaks)", report.entries.len());
        }
        report
    }

    /// Tear the allocator down now, logging and returning the final report.
    /// Blocks that are still allocated stay allocated.
    pub fn shutdown(mut self) -> LeakReport {
        self.emit_report()
    }
}

impl<H> Drop for InstrumentedAlloc<H>
where
    H: RawHeap,
{
    fn drop(&mut self) {
        if !self.reported {
            self.emit_report();
        }
        // the registry goes with the rest of the fields
    }
}

fn unknown_memory(op: AllocOp, ptr: *mut u8, guard: Option<GuardTag>) -> AllocError {
    cold(|| {
        match guard {
            Some(guard) => error!("{op} unknown memory at {:#x} ({guard:?})", ptr as usize),
            None => error!("{op} unknown memory at {:#x} (misaligned)", ptr as usize),
        }
        AllocError::UnknownMemory {
            op,
            address: ptr as usize,
        }
    })
}

fn out_of_memory(size: usize) -> AllocError {
    cold(|| {
        error!("out of memory allocating {size} bytes");
        AllocError::OutOfMemory { size }
    })
}

/// Layout of a block that is already allocated, so is known to be valid.
fn raw_layout_of(size: usize) -> Layout {
    // SAFETY: the same layout was built with `BlockHeader::raw_layout()`
    // when this block was (re)allocated
    unsafe { Layout::from_size_align_unchecked(HEADER_SIZE + size, BLOCK_ALIGN) }
}

fn leak_entry((slot, block): (usize, NonNull<u8>)) -> LeakEntry {
    // SAFETY: registered blocks are live, and their headers belong to us
    let header = unsafe { BlockHeader::in_block(block).as_ref() };
    let provenance = header.provenance();
    LeakEntry {
        slot,
        address: BlockHeader::payload_of(block).as_ptr() as *const (),
        size: header.size(),
        type_tag: provenance.type_tag.map(str::to_owned),
        file: provenance.file().map(str::to_owned),
        line: provenance.line(),
    }
}
