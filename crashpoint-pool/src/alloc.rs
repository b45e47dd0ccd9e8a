// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Minimal persistent allocator.
//!
//! Hands out bytes from the working heap with a bump pointer and carries the
//! root table in its persistent header at the base of the heap. Freed memory
//! is not reclaimed (persistent-memory GC is out of scope). Every metadata
//! mutation is announced to the dirty tracker so the allocator state itself
//! is checkpointed like any other heap data.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crashpoint_core::persist::round_up;
use crashpoint_core::pptr::{from_off, to_off, PPTR_NULL_OFF};
use crashpoint_core::{CACHE_LINE_SIZE, MAX_ROOTS};

use crate::engine::Engine;
use crate::hook::annotate_checkpoint_region;
use crate::PoolError;

const HEAP_MAGIC: u32 = 0x6f6f0404;

/// Allocation granularity.
const ALLOC_ALIGN: usize = 16;

#[repr(C)]
struct HeapHeader {
    magic: u32,
    _reserved: u32,
    capacity: u64,
    tail: u64,
    roots: [u64; MAX_ROOTS],
}

/// Bump allocator over the working heap of an engine.
pub struct HeapAllocator {
    engine: Arc<dyn Engine>,
    header: *mut HeapHeader,
}

// SAFETY: the tail is mutated through an atomic view; root slots are plain
// words whose consistency is the caller's concern, as with any heap data.
unsafe impl Send for HeapAllocator {}
unsafe impl Sync for HeapAllocator {}

impl HeapAllocator {
    /// Attach to the heap of `engine`. `fresh` selects between initialising
    /// a new header and validating an existing one.
    pub fn open(engine: &Arc<dyn Engine>, fresh: bool) -> Result<HeapAllocator, PoolError> {
        let base = engine.base_address();
        let capacity = engine.capacity();
        if capacity < std::mem::size_of::<HeapHeader>() {
            return Err(PoolError::AllocOptions);
        }
        let header = base.cast::<HeapHeader>();
        let allocator = HeapAllocator {
            engine: Arc::clone(engine),
            header,
        };

        if fresh {
            // SAFETY: the header region is inside the heap mapping.
            unsafe {
                (*header).magic = HEAP_MAGIC;
                (*header)._reserved = 0;
                (*header).capacity = capacity as u64;
                (*header).tail =
                    round_up(std::mem::size_of::<HeapHeader>(), CACHE_LINE_SIZE) as u64;
                for slot in (*header).roots.iter_mut() {
                    *slot = PPTR_NULL_OFF;
                }
            }
            annotate_checkpoint_region(base, std::mem::size_of::<HeapHeader>());
        } else {
            // SAFETY: as above.
            let magic = unsafe { (*header).magic };
            if magic != HEAP_MAGIC {
                return Err(PoolError::Core(crashpoint_core::Error::MagicMismatch));
            }
        }
        Ok(allocator)
    }

    fn tail(&self) -> &AtomicU64 {
        // SAFETY: the field is 8-byte aligned inside the mapped header and
        // only accessed through this atomic view.
        unsafe { &*std::ptr::addr_of!((*self.header).tail).cast::<AtomicU64>() }
    }

    /// Allocate `size` bytes. Returns None when the heap is exhausted.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let capacity = self.engine.capacity() as u64;
        let tail = self.tail();
        let mut current = tail.load(Ordering::Relaxed);
        loop {
            let start = round_up(current as usize, ALLOC_ALIGN) as u64;
            let end = start.checked_add(size as u64)?;
            if end > capacity {
                return None;
            }
            match tail.compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    // SAFETY: the header lives in the heap mapping and start
                    // is bounds-checked above.
                    let ptr = unsafe {
                        let tail_ptr = std::ptr::addr_of_mut!((*self.header).tail);
                        annotate_checkpoint_region(tail_ptr.cast(), 8);
                        self.engine.base_address().add(start as usize)
                    };
                    return NonNull::new(ptr);
                }
                Err(seen) => current = seen,
            }
        }
    }

    /// Release an allocation. A recorded no-op: the bump allocator does not
    /// reclaim.
    pub fn free(&self, _ptr: *mut u8) {}

    pub fn set_root(&self, index: usize, target: *const u8) -> Result<(), PoolError> {
        if index >= MAX_ROOTS {
            return Err(PoolError::RootIndex);
        }
        // SAFETY: index is bounded; the slot lives in the mapped header.
        unsafe {
            let slot = std::ptr::addr_of_mut!((*self.header).roots[index]);
            slot.write(to_off(target, slot.cast()));
            annotate_checkpoint_region(slot.cast(), 8);
        }
        Ok(())
    }

    pub fn get_root(&self, index: usize) -> *mut u8 {
        if index >= MAX_ROOTS {
            return std::ptr::null_mut();
        }
        // SAFETY: index is bounded; the slot lives in the mapped header.
        unsafe {
            let slot = std::ptr::addr_of!((*self.header).roots[index]);
            from_off(slot.read(), slot.cast())
        }
    }
}
