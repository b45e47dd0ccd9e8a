// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Volatile dirty tracker.
//!
//! Tracks modified blocks and segments since the previous checkpoint: a
//! global bitmap pair per granularity plus one bounded id buffer per thread.
//! The instrumented engine uses both epochs of the bitmaps; the single-epoch
//! engines only epoch 0.
//!
//! Buffer appends are performed by the owning thread only. Other threads read
//! the buffers during a checkpoint, after the rendezvous barrier and its
//! release/acquire fence pair, so plain release stores of the length are
//! sufficient to publish the contents.

use std::alloc::{alloc, dealloc, Layout};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::bitset::AtomicBitSet;
use crate::threads::{current_thread_slot, try_current_thread_slot};
use crate::MAX_THREADS;

/// Alignment of the per-thread id arrays.
const BUFFER_ALIGN: usize = 4096;

/// One per-thread buffer of dirty ids. Cache-line aligned so that length
/// updates of neighbouring threads do not false-share.
#[repr(align(64))]
struct FlushBuffer {
    len: AtomicUsize,
    ids: AtomicPtr<u64>,
}

impl FlushBuffer {
    fn new() -> Self {
        FlushBuffer {
            len: AtomicUsize::new(0),
            ids: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

/// Summary of buffer fill levels, input to the flush-mode decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillState {
    pub all_empty: bool,
    pub has_full: bool,
}

pub struct DirtyTracker {
    block_dirty: [AtomicBitSet; 2],
    segment_dirty: [AtomicBitSet; 2],
    buffers: Box<[FlushBuffer]>,
    buffer_capacity: usize,
    block_shift: u32,
    segment_shift: u32,
    /// Set when a dirty id could not be buffered at all (no thread slot, no
    /// preallocated buffer). The id lists are then incomplete and the next
    /// checkpoint must walk the bitmaps instead.
    lossy: AtomicBool,
}

// SAFETY: buffer ownership is per-thread by protocol; everything else is
// atomic.
unsafe impl Send for DirtyTracker {}
unsafe impl Sync for DirtyTracker {}

impl DirtyTracker {
    pub fn new(
        nr_blocks: u64,
        nr_segments: u64,
        block_shift: u32,
        segment_shift: u32,
        buffer_capacity: usize,
    ) -> Self {
        let buffers = (0..MAX_THREADS).map(|_| FlushBuffer::new()).collect();
        DirtyTracker {
            block_dirty: [AtomicBitSet::new(nr_blocks), AtomicBitSet::new(nr_blocks)],
            segment_dirty: [
                AtomicBitSet::new(nr_segments),
                AtomicBitSet::new(nr_segments),
            ],
            buffers,
            buffer_capacity,
            block_shift,
            segment_shift,
            lossy: AtomicBool::new(false),
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn block_dirty(&self, epoch: usize) -> &AtomicBitSet {
        &self.block_dirty[epoch]
    }

    pub fn segment_dirty(&self, epoch: usize) -> &AtomicBitSet {
        &self.segment_dirty[epoch]
    }

    fn layout(&self) -> Layout {
        Layout::from_size_align(self.buffer_capacity * 8, BUFFER_ALIGN)
            .expect("flush buffer layout")
    }

    fn try_ids_ptr(&self, buffer: &FlushBuffer) -> Option<*mut u64> {
        let ptr = buffer.ids.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    fn ids_ptr(&self, buffer: &FlushBuffer) -> *mut u64 {
        if let Some(ptr) = self.try_ids_ptr(buffer) {
            return ptr;
        }
        // First touch by the owning thread; nobody else writes this field.
        // SAFETY: layout has non-zero size.
        let fresh = unsafe { alloc(self.layout()) }.cast::<u64>();
        assert!(!fresh.is_null(), "flush buffer allocation failed");
        buffer.ids.store(fresh, Ordering::Release);
        fresh
    }

    /// Allocate every per-thread buffer up front. The fault-driven engines
    /// call this so [`DirtyTracker::record_nonblocking`] can buffer ids
    /// without allocating inside a signal handler.
    pub fn preallocate_buffers(&self) {
        for buffer in self.buffers.iter() {
            self.ids_ptr(buffer);
        }
    }

    /// Record a store hitting `block_id`. Fast path: the block is already
    /// dirty in this epoch and nothing happens. Otherwise the bit is set,
    /// the id appended to the calling thread's buffer (dropped if the buffer
    /// is full, which later forces the lossy flush mode), and the owning
    /// segment marked dirty.
    pub fn record(&self, epoch: usize, block_id: u64) {
        self.record_as(epoch, block_id, Some(current_thread_slot()), true);
    }

    /// Signal-handler form of [`DirtyTracker::record`]: never registers a
    /// thread slot, never blocks, never allocates. When the calling thread
    /// has no slot yet (or its buffer was not preallocated) the id cannot be
    /// buffered; the tracker is then marked lossy so the next checkpoint
    /// walks the bitmaps instead of the incomplete id lists.
    pub fn record_nonblocking(&self, epoch: usize, block_id: u64) {
        self.record_as(epoch, block_id, try_current_thread_slot(), false);
    }

    fn record_as(&self, epoch: usize, block_id: u64, slot: Option<usize>, may_allocate: bool) {
        if self.block_dirty[epoch].test(block_id, Ordering::Acquire) {
            return;
        }
        self.block_dirty[epoch].set(block_id, Ordering::Release);

        let buffered = slot.and_then(|slot| {
            let buffer = &self.buffers[slot];
            let ids = if may_allocate {
                Some(self.ids_ptr(buffer))
            } else {
                self.try_ids_ptr(buffer)
            }?;
            let len = buffer.len.load(Ordering::Relaxed);
            if len != self.buffer_capacity {
                // SAFETY: len < capacity and this thread owns the buffer.
                unsafe { ids.add(len).write(block_id) };
                buffer.len.store(len + 1, Ordering::Release);
            }
            // A full buffer is visible to fill_state on its own.
            Some(())
        });
        if buffered.is_none() {
            self.lossy.store(true, Ordering::Release);
        }

        let segment_id = block_id >> (self.segment_shift - self.block_shift);
        if !self.segment_dirty[epoch].test(segment_id, Ordering::Acquire) {
            self.segment_dirty[epoch].set(segment_id, Ordering::Release);
        }
    }

    /// Record a store over `[addr, addr + len)` expressed as byte offsets
    /// into the heap, splitting it into its block-aligned cover.
    pub fn record_range(&self, epoch: usize, offset: usize, len: usize) {
        let block_size = 1usize << self.block_shift;
        let mut pos = offset & !(block_size - 1);
        while pos < offset + len {
            self.record(epoch, (pos >> self.block_shift) as u64);
            pos += block_size;
        }
    }

    pub fn buffer_len(&self, slot: usize) -> usize {
        self.buffers[slot].len.load(Ordering::Acquire)
    }

    /// The ids buffered by thread `slot`. Valid to call from any thread once
    /// a checkpoint rendezvous has published the buffers.
    pub fn buffer(&self, slot: usize) -> &[u64] {
        let len = self.buffers[slot].len.load(Ordering::Acquire);
        if len == 0 {
            return &[];
        }
        let ids = self.buffers[slot].ids.load(Ordering::Acquire);
        // SAFETY: len entries were initialised before the release store that
        // published len.
        unsafe { std::slice::from_raw_parts(ids, len) }
    }

    pub fn fill_state(&self) -> FillState {
        let lossy = self.lossy.load(Ordering::Acquire);
        let mut all_empty = !lossy;
        let mut has_full = lossy;
        for buffer in self.buffers.iter() {
            let len = buffer.len.load(Ordering::Acquire);
            if len != 0 {
                all_empty = false;
            }
            if len == self.buffer_capacity {
                has_full = true;
            }
        }
        FillState {
            all_empty,
            has_full,
        }
    }

    /// Reset every per-thread buffer length and the lossy marker. The dirty
    /// bits are cleared separately, when the protocol has mirrored the data
    /// they cover.
    pub fn reset_buffers(&self) {
        for buffer in self.buffers.iter() {
            buffer.len.store(0, Ordering::Relaxed);
        }
        self.lossy.store(false, Ordering::Relaxed);
    }

    /// Clear the block and segment bits of `epoch` for every buffered id.
    /// Only valid in the non-lossy mode where buffers and bitmaps agree.
    pub fn clear_buffered_bits(&self, epoch: usize) {
        for slot in 0..self.buffers.len() {
            for &block_id in self.buffer(slot) {
                self.block_dirty[epoch].clear(block_id);
                let segment_id = block_id >> (self.segment_shift - self.block_shift);
                self.segment_dirty[epoch].clear(segment_id);
            }
        }
    }

    /// Zero the whole bitmap pair of `epoch`.
    pub fn clear_epoch(&self, epoch: usize) {
        let blocks = &self.block_dirty[epoch];
        blocks.clear_range(0, blocks.nr_bits());
        let segments = &self.segment_dirty[epoch];
        segments.clear_range(0, segments.nr_bits());
    }
}

impl Drop for DirtyTracker {
    fn drop(&mut self) {
        let layout = self.layout();
        for buffer in self.buffers.iter() {
            let ptr = buffer.ids.load(Ordering::Relaxed);
            if !ptr.is_null() {
                // SAFETY: allocated in ids_ptr with the same layout.
                unsafe { dealloc(ptr.cast(), layout) };
            }
        }
    }
}

#[cfg(test)]
mod t_tracker {
    use super::*;
    use crate::{BLOCK_SHIFT, SEGMENT_SHIFT};

    fn tracker(capacity: usize) -> DirtyTracker {
        DirtyTracker::new(1 << 16, 8, BLOCK_SHIFT, SEGMENT_SHIFT, capacity)
    }

    #[test]
    fn record_sets_bits_and_buffers_once() {
        let t = tracker(16);
        t.record(0, 42);
        t.record(0, 42);
        t.record(0, 43);

        assert!(t.block_dirty(0).test(42, Ordering::Relaxed));
        assert!(t.block_dirty(0).test(43, Ordering::Relaxed));
        assert!(t.segment_dirty(0).test(0, Ordering::Relaxed));

        let slot = current_thread_slot();
        assert_eq!(t.buffer(slot), &[42, 43]);
    }

    #[test]
    fn epochs_are_independent() {
        let t = tracker(16);
        t.record(0, 7);
        assert!(!t.block_dirty(1).test(7, Ordering::Relaxed));
        t.record(1, 7);
        assert!(t.block_dirty(1).test(7, Ordering::Relaxed));
    }

    #[test]
    fn full_buffer_goes_lossy_but_keeps_bits() {
        let t = tracker(4);
        for block in 0..6u64 {
            t.record(0, block);
        }
        let slot = current_thread_slot();
        assert_eq!(t.buffer_len(slot), 4);
        // Bits survive even though the buffer dropped the overflow.
        assert!(t.block_dirty(0).test(5, Ordering::Relaxed));
        let fill = t.fill_state();
        assert!(fill.has_full);
        assert!(!fill.all_empty);
    }

    #[test]
    fn record_range_covers_blocks() {
        let t = tracker(64);
        // 3 bytes straddling a block boundary dirty two blocks.
        t.record_range(0, 255, 3);
        assert!(t.block_dirty(0).test(0, Ordering::Relaxed));
        assert!(t.block_dirty(0).test(1, Ordering::Relaxed));
        assert!(!t.block_dirty(0).test(2, Ordering::Relaxed));
    }

    #[test]
    fn nonblocking_record_buffers_for_registered_threads() {
        let t = tracker(16);
        t.preallocate_buffers();
        let slot = crate::threads::register_current_thread();
        t.record_nonblocking(0, 5);
        assert_eq!(t.buffer(slot), &[5]);
        assert!(!t.fill_state().has_full);
    }

    /// A thread that faults before ever touching the runtime has no slot;
    /// its ids land in the bitmap only and the tracker turns lossy so the
    /// next checkpoint walks the bitmaps.
    #[test]
    fn nonblocking_record_without_a_slot_goes_lossy() {
        let t = tracker(16);
        t.preallocate_buffers();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                t.record_nonblocking(0, 9);
            });
        });
        assert!(t.block_dirty(0).test(9, Ordering::Relaxed));
        assert!(t.segment_dirty(0).test(0, Ordering::Relaxed));
        let fill = t.fill_state();
        assert!(fill.has_full);
        assert!(!fill.all_empty);

        t.reset_buffers();
        assert!(t.fill_state().all_empty);
        assert!(!t.fill_state().has_full);
    }

    #[test]
    fn clear_buffered_bits_restores_clean_state() {
        let t = tracker(16);
        t.record(0, 100);
        t.record(0, 9000);
        t.clear_buffered_bits(0);
        t.reset_buffers();
        assert!(!t.block_dirty(0).any());
        assert!(!t.segment_dirty(0).any());
        assert!(t.fill_state().all_empty);
    }
}
