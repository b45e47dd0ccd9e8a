// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Instrumented dual-epoch engine, the default variant.
//!
//! The mutator works in an anonymous heap mapped at the fixed base; the
//! image file carries a main and a back arena. Dirty blocks are recorded by
//! the instrumentation hooks into dual-epoch bitmaps and per-thread
//! buffers. Checkpoints alternate their target side: odd epochs write the
//! dirty blocks into the back arena, even epochs into the main arena, and a
//! single epoch-flip commit re-points the segment states at the side just
//! written.
//!
//! After a commit toward side T the opposite side still holds the previous
//! checkpoint for the segments just written. The "mirror" brings it up to
//! date: synchronously in the same checkpoint (block-list mode), by the
//! background write-back thread (lossy mode), or by a pre-pass at the start
//! of the next checkpoint. A segment's dirty bits are cleared exactly when
//! its mirror completes, so at every instant the side a future checkpoint
//! will overwrite is either stale-and-about-to-be-rewritten or already
//! identical to the committed copy.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crashpoint_core::bitset::AtomicBitSet;
use crashpoint_core::image::{CheckpointImage, SegmentState, ATTR_HAS_SNAPSHOT};
use crashpoint_core::mapping::{map_anonymous, unmap_anonymous, FileMapping};
use crashpoint_core::persist::{flush_range, nt_copy, nt_copy_eliding, store_fence};
use crashpoint_core::sync::{Barrier, SpinFlag};
use crashpoint_core::tracker::DirtyTracker;
use crashpoint_core::{
    BLOCKS_PER_SEGMENT, BLOCK_SHIFT, BLOCK_SIZE, MAX_FLUSH_BLOCKS, NULL_SEGMENT, SEGMENT_LOCKS,
    SEGMENT_SHIFT, SEGMENT_SIZE,
};

use crate::background::Background;
use crate::engine::{Coordinator, Engine};
use crate::engines::{create_capacity, fixed_base};
use crate::global_flush::GlobalFlush;
use crate::{hook, registry, PoolError, PoolOptions};

/// Which arena a checkpoint writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Main,
    Back,
}

impl Side {
    fn of_epoch(epoch: u64) -> Side {
        if epoch & 1 == 1 {
            Side::Back
        } else {
            Side::Main
        }
    }

    fn opposite(self) -> Side {
        match self {
            Side::Main => Side::Back,
            Side::Back => Side::Main,
        }
    }

    fn state(self) -> SegmentState {
        match self {
            Side::Main => SegmentState::Main,
            Side::Back => SegmentState::Back,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FlushMode {
    NoAction = 0,
    FlushBlocks = 1,
    GlobalWriteback = 2,
}

impl FlushMode {
    fn from_u8(value: u8) -> FlushMode {
        match value {
            1 => FlushMode::FlushBlocks,
            2 => FlushMode::GlobalWriteback,
            _ => FlushMode::NoAction,
        }
    }
}

pub struct InstrumentedEngine {
    _mapping: FileMapping,
    image: CheckpointImage,
    working: *mut u8,
    capacity: usize,
    nr_segments: u64,
    nr_blocks: u64,

    tracker: DirtyTracker,
    /// Direction of the next commit: 1 targets back, 0 targets main.
    epoch: AtomicU64,

    next_thread_id: AtomicU64,
    barrier: Barrier,
    latch: Barrier,
    flush_mode: AtomicU8,
    checkpoint_in_progress: AtomicBool,
    write_back_lock: SpinFlag,
    back_alloc_lock: SpinFlag,
    next_back_segment: AtomicU64,
    segment_locks: Box<[SpinFlag]>,
    has_snapshot: AtomicBool,
    background: Arc<Background>,
    checkpoint_traffic: AtomicU64,
    verbose: bool,
}

// SAFETY: the working heap pointer is shared by design; all mutation of
// shared protocol state is through atomics, spin locks and the barriers.
unsafe impl Send for InstrumentedEngine {}
unsafe impl Sync for InstrumentedEngine {}

impl InstrumentedEngine {
    pub fn open(
        path: &Path,
        options: &PoolOptions,
        comm: Option<&dyn Coordinator>,
    ) -> Result<Arc<dyn Engine>, PoolError> {
        let mut create = options.create && (options.truncate || !FileMapping::exists(path));
        if let Some(comm) = comm {
            // Every rank must agree on whether the image is fresh.
            let creates = comm.allreduce_sum_u64(create as u64);
            if creates != 0 && creates != comm.size() as u64 {
                return Err(PoolError::CreateMismatch);
            }
            create = creates != 0;
        }

        let (mapping, image, capacity) = if create {
            let capacity = create_capacity(options);
            let nr_segments = (capacity >> SEGMENT_SHIFT) as u64;
            let nr_back =
                (((nr_segments as f64) * options.shadow_capacity_factor) as u64).max(1);
            let file_size = CheckpointImage::file_size(nr_segments, nr_back);
            let mapping = FileMapping::create(path, file_size, None)?;
            let image = CheckpointImage::create(mapping.base(), nr_segments, nr_back)?;
            info!(
                path = %path.display(),
                nr_segments,
                nr_back,
                "created checkpoint image"
            );
            (mapping, image, capacity)
        } else {
            let mapping = FileMapping::open(path, None)?;
            let image = CheckpointImage::open(mapping.base())?;
            let capacity = image.nr_main_segments() as usize * SEGMENT_SIZE;
            (mapping, image, capacity)
        };

        let nr_segments = image.nr_main_segments();
        let nr_blocks = nr_segments * BLOCKS_PER_SEGMENT;
        let working = map_anonymous(capacity, fixed_base(options))?;

        let engine = InstrumentedEngine {
            _mapping: mapping,
            image,
            working,
            capacity,
            nr_segments,
            nr_blocks,
            tracker: DirtyTracker::new(
                nr_blocks,
                nr_segments,
                BLOCK_SHIFT,
                SEGMENT_SHIFT,
                MAX_FLUSH_BLOCKS,
            ),
            epoch: AtomicU64::new(1),
            next_thread_id: AtomicU64::new(0),
            barrier: Barrier::new(),
            latch: Barrier::new(),
            flush_mode: AtomicU8::new(FlushMode::NoAction as u8),
            checkpoint_in_progress: AtomicBool::new(false),
            write_back_lock: SpinFlag::new(),
            back_alloc_lock: SpinFlag::new(),
            next_back_segment: AtomicU64::new(0),
            segment_locks: (0..SEGMENT_LOCKS).map(|_| SpinFlag::new()).collect(),
            has_snapshot: AtomicBool::new(false),
            background: Arc::new(Background::new()),
            checkpoint_traffic: AtomicU64::new(0),
            verbose: options.verbose,
        };

        if !create {
            if let Some(comm) = comm {
                let my_epoch = engine.image.committed_epoch();
                let min_epoch = comm.allreduce_min_u64(my_epoch);
                if my_epoch - min_epoch >= 2 {
                    return Err(PoolError::EpochSkew);
                }
                if min_epoch != my_epoch {
                    warn!(my_epoch, min_epoch, "rolling back to communicator minimum epoch");
                    engine.image.reset_committed_epoch(min_epoch);
                }
                comm.barrier();
            }
            let started = std::time::Instant::now();
            engine.image.recovery(SegmentState::Main);
            engine.prepare_working_memory();
            engine
                .has_snapshot
                .store(engine.image.attributes() & ATTR_HAS_SNAPSHOT != 0, Ordering::Relaxed);
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                epoch = engine.image.committed_epoch(),
                "recovered checkpoint image"
            );
        }

        let engine: Arc<InstrumentedEngine> = Arc::new(engine);
        let as_dyn: Arc<dyn Engine> = engine.clone();
        registry::register(&as_dyn);
        Self::spawn_background(&engine);
        Ok(as_dyn)
    }

    /// Load the committed heap into the working memory. Recovery has already
    /// equalised both arenas, so the main side is read for every segment
    /// that was ever written.
    fn prepare_working_memory(&self) {
        for segment_id in 0..self.nr_segments {
            if self.image.segment_state(segment_id) == SegmentState::Initial {
                continue;
            }
            // SAFETY: both pointers address one whole segment.
            unsafe {
                nt_copy_eliding(
                    self.working.add(segment_id as usize * SEGMENT_SIZE),
                    self.image.main_segment(segment_id),
                    SEGMENT_SIZE,
                );
            }
        }
        store_fence();
    }

    fn spawn_background(engine: &Arc<InstrumentedEngine>) {
        let weak: Weak<InstrumentedEngine> = Arc::downgrade(engine);
        let background = engine.background.clone();
        let thread_bg = background.clone();
        let handle = std::thread::Builder::new()
            .name("crashpoint-writeback".into())
            .spawn(move || {
                while thread_bg.await_work() {
                    if let Some(engine) = weak.upgrade() {
                        engine.write_back_lock.acquire();
                        let mirror_epoch = 1 - (engine.epoch.load(Ordering::Acquire) & 1);
                        engine.mirror_epoch(mirror_epoch as usize, 0, 1, true);
                        engine.write_back_lock.release();
                    }
                    thread_bg.finish();
                }
            })
            .expect("spawn background write-back thread");
        background.set_handle(handle);
    }

    #[inline]
    fn working_block(&self, block_id: u64) -> *mut u8 {
        // SAFETY: bounded by the heap capacity.
        unsafe { self.working.add(block_id as usize * BLOCK_SIZE) }
    }

    #[inline]
    fn working_segment(&self, segment_id: u64) -> *mut u8 {
        // SAFETY: bounded by the heap capacity.
        unsafe { self.working.add(segment_id as usize * SEGMENT_SIZE) }
    }

    fn side_segment(&self, side: Side, segment_id: u64, back_id: u64) -> *mut u8 {
        match side {
            Side::Main => self.image.main_segment(segment_id),
            Side::Back => self.image.back_segment(back_id),
        }
    }

    fn current_flush_mode(&self) -> FlushMode {
        FlushMode::from_u8(self.flush_mode.load(Ordering::Acquire))
    }

    fn determine_flush_mode(&self) -> FlushMode {
        let fill = self.tracker.fill_state();
        let mode = if fill.all_empty {
            FlushMode::NoAction
        } else if fill.has_full {
            FlushMode::GlobalWriteback
        } else {
            FlushMode::FlushBlocks
        };
        self.flush_mode.store(mode as u8, Ordering::Release);
        mode
    }

    /// Phase 3: make the dirty working-heap lines visible to the copy
    /// engines. In block-list mode every thread walks its share of the
    /// buffers; in lossy mode the leader asks for a cache-wide write-back,
    /// degrading to a bitmap walk when the device is missing.
    fn flush_parallel(&self, tid: usize, nr_threads: u64, mode: FlushMode) {
        match mode {
            FlushMode::NoAction => {}
            FlushMode::FlushBlocks => {
                let mut slot = tid;
                while slot < crashpoint_core::MAX_THREADS {
                    for &block_id in self.tracker.buffer(slot) {
                        // SAFETY: the block lies inside the working heap.
                        unsafe { flush_range(self.working_block(block_id), BLOCK_SIZE) };
                    }
                    slot += nr_threads as usize;
                }
            }
            FlushMode::GlobalWriteback => {
                if tid == 0 && !GlobalFlush::get().flush() {
                    let epoch = (self.epoch.load(Ordering::Relaxed) & 1) as usize;
                    let dirty = self.tracker.segment_dirty(epoch);
                    let mut segment_id = 0;
                    while segment_id < self.nr_segments {
                        if dirty.test(segment_id, Ordering::Relaxed) {
                            // SAFETY: one whole segment of the working heap.
                            unsafe {
                                flush_range(self.working_segment(segment_id), SEGMENT_SIZE)
                            };
                        }
                        segment_id += 1;
                    }
                }
            }
        }
        store_fence();
    }

    /// Bind a back slot for `segment_id`, scanning the circular slot array.
    /// Eligible victims are unbound slots and slots whose main segment has
    /// its current-epoch dirty bit clear. Exhaustion is fatal: the design
    /// assumes the shadow arena covers one checkpoint interval's working
    /// set.
    fn allocate_back_segment(&self, segment_id: u64, epoch: usize) -> u64 {
        // Binding only changes while a checkpoint owns the protocol.
        debug_assert!(self.checkpoint_in_progress.load(Ordering::Relaxed));
        self.back_alloc_lock.acquire();
        // Re-check under the lock: a racing thread may have bound it.
        let existing = self.image.main_to_back(segment_id);
        if existing != NULL_SEGMENT {
            self.back_alloc_lock.release();
            return existing;
        }
        let nr_back = self.image.nr_back_segments();
        let mut scanned = 0;
        while scanned < nr_back {
            let candidate = self.next_back_segment.load(Ordering::Relaxed);
            self.next_back_segment
                .store((candidate + 1) % nr_back, Ordering::Relaxed);
            let old_main = self.image.back_to_main(candidate);
            if old_main == NULL_SEGMENT
                || !self.tracker.segment_dirty(epoch).test(old_main, Ordering::Relaxed)
            {
                self.image.bind_back_segment(segment_id, candidate);
                self.back_alloc_lock.release();
                return candidate;
            }
            scanned += 1;
        }
        self.back_alloc_lock.release();
        tracing::error!(segment_id, "back arena exhausted within one checkpoint interval");
        std::process::abort();
    }

    fn find_back_segment(&self, segment_id: u64, epoch: usize) -> (u64, bool) {
        let back_id = self.image.main_to_back(segment_id);
        if back_id != NULL_SEGMENT {
            (back_id, false)
        } else {
            (self.allocate_back_segment(segment_id, epoch), true)
        }
    }

    /// Ensure the last committed version of `segment_id` survives a
    /// write-back into `target`. Runs under the segment lock to exclude the
    /// background mirror. Only needed when the authoritative state already
    /// designates the target side, which happens for segments that stayed
    /// clean across two or more commits.
    fn protect_segment(&self, segment_id: u64, target: Side, epoch: usize) {
        if self.image.segment_state(segment_id) != target.state() {
            return;
        }
        let lock = &self.segment_locks[(segment_id as usize) & (SEGMENT_LOCKS - 1)];
        lock.acquire();
        if self.image.segment_state(segment_id) != target.state() {
            lock.release();
            return;
        }
        match target {
            Side::Main => {
                // The committed copy is in main and about to be overwritten.
                // Segments clean long enough to get here were mirrored after
                // their last commit, so an existing shadow already matches;
                // only a fresh binding needs the copy.
                let (back_id, created) = self.find_back_segment(segment_id, epoch);
                if created {
                    // SAFETY: whole-segment copy between the two arenas.
                    unsafe {
                        nt_copy(
                            self.image.back_segment(back_id),
                            self.image.main_segment(segment_id),
                            SEGMENT_SIZE,
                        );
                    }
                    store_fence();
                }
                self.image
                    .set_segment_state_atomic(segment_id, SegmentState::Back);
            }
            Side::Back => {
                // The committed copy is in back; the mirror after its commit
                // put the same bytes in main, so re-pointing suffices.
                self.image
                    .set_segment_state_atomic(segment_id, SegmentState::Main);
            }
        }
        store_fence();
        lock.release();
    }

    /// Copy one dirty segment's blocks from the working heap into `target`.
    /// A freshly bound shadow of a non-initial segment takes one
    /// whole-segment copy instead, covering whatever the slot held before.
    fn write_back_segment(
        &self,
        segment_id: u64,
        target: Side,
        epoch: usize,
        protect: bool,
    ) -> u64 {
        if protect {
            self.protect_segment(segment_id, target, epoch);
        }
        let (back_id, created) = if target == Side::Back {
            self.find_back_segment(segment_id, epoch)
        } else {
            (NULL_SEGMENT, false)
        };

        let mut traffic = 0;
        if created && self.image.segment_state(segment_id) != SegmentState::Initial {
            // SAFETY: whole segment, working heap to back arena.
            unsafe {
                nt_copy(
                    self.image.back_segment(back_id),
                    self.working_segment(segment_id),
                    SEGMENT_SIZE,
                );
            }
            return SEGMENT_SIZE as u64;
        }

        let dst_base = self.side_segment(target, segment_id, back_id);
        let start_block = segment_id * BLOCKS_PER_SEGMENT;
        let stop_block = self.nr_blocks.min(start_block + BLOCKS_PER_SEGMENT);
        let mut block_id = start_block;
        while block_id < stop_block {
            let mut word = self.tracker.block_dirty(epoch).word(block_id);
            while word != 0 {
                let bit = word.trailing_zeros() as u64;
                word &= word - 1;
                let local = block_id - start_block + bit;
                // SAFETY: one block inside the segment on both sides.
                unsafe {
                    nt_copy(
                        dst_base.add(local as usize * BLOCK_SIZE),
                        self.working_block(block_id + bit),
                        BLOCK_SIZE,
                    );
                }
                traffic += BLOCK_SIZE as u64;
            }
            block_id += AtomicBitSet::BIT_WIDTH;
        }
        traffic
    }

    /// Phase 4 (and the in-checkpoint mirror): write every dirty block of
    /// `epoch` into `target`, dividing the work across the participants.
    fn write_back_parallel(
        &self,
        tid: usize,
        nr_threads: u64,
        mode: FlushMode,
        epoch: usize,
        target: Side,
        protect: bool,
    ) {
        let mut traffic = 0;
        match mode {
            FlushMode::NoAction => {}
            FlushMode::FlushBlocks => {
                // Walk the per-thread buffers; protection and slot discovery
                // are per segment, so consecutive blocks of one segment hit
                // the fast path.
                let mut slot = tid;
                while slot < crashpoint_core::MAX_THREADS {
                    let mut last_segment = NULL_SEGMENT;
                    for &block_id in self.tracker.buffer(slot) {
                        let segment_id = block_id >> (SEGMENT_SHIFT - BLOCK_SHIFT);
                        if segment_id != last_segment {
                            traffic +=
                                self.write_back_segment(segment_id, target, epoch, protect);
                            last_segment = segment_id;
                        }
                    }
                    slot += nr_threads as usize;
                }
            }
            FlushMode::GlobalWriteback => {
                let mut segment_id = tid as u64;
                while segment_id < self.nr_segments {
                    if self
                        .tracker
                        .segment_dirty(epoch)
                        .test(segment_id, Ordering::Relaxed)
                    {
                        traffic += self.write_back_segment(segment_id, target, epoch, protect);
                    }
                    segment_id += nr_threads;
                }
            }
        }
        store_fence();
        self.checkpoint_traffic.fetch_add(traffic, Ordering::Relaxed);
    }

    /// Phase 5: stage the target-side state for every segment dirty in
    /// either epoch and advance the commit point.
    fn commit_layout_state(&self, state: SegmentState, comm: Option<&dyn Coordinator>) {
        let mut update = self.image.begin_state_update();
        let mut segment_id = 0;
        while segment_id < self.nr_segments {
            let mut word = self.tracker.segment_dirty(0).word(segment_id)
                | self.tracker.segment_dirty(1).word(segment_id);
            while word != 0 {
                let bit = word.trailing_zeros() as u64;
                word &= word - 1;
                update.set(segment_id + bit, state);
            }
            segment_id += AtomicBitSet::BIT_WIDTH;
        }
        match comm {
            Some(comm) => update.commit_with_barrier(&|| comm.barrier()),
            None => update.commit(),
        }
    }

    /// Copy the blocks committed in `epoch` from the side they were written
    /// to into the opposite side. Blocks already re-dirtied in the other
    /// epoch are skipped: the next checkpoint rewrites them anyway. With
    /// `clear` the mirrored epoch's bits are dropped afterwards.
    fn mirror_epoch(&self, epoch: usize, tid: usize, nr_threads: u64, clear: bool) {
        let src = Side::of_epoch(epoch as u64);
        let dst = src.opposite();
        let other_epoch = 1 - epoch;
        let mut segment_id = tid as u64;
        while segment_id < self.nr_segments {
            if !self
                .tracker
                .segment_dirty(epoch)
                .test(segment_id, Ordering::Relaxed)
            {
                segment_id += nr_threads;
                continue;
            }
            let back_id = self.image.main_to_back(segment_id);
            if back_id == NULL_SEGMENT {
                // Either the slot was stolen (legal only once this segment's
                // mirror completed) or a main-direction commit never had a
                // shadow. Nothing is owed; a later overwrite of the committed
                // side goes through the protection path.
                if clear {
                    let start_block = segment_id * BLOCKS_PER_SEGMENT;
                    let stop_block = self.nr_blocks.min(start_block + BLOCKS_PER_SEGMENT);
                    self.tracker
                        .block_dirty(epoch)
                        .clear_range(start_block, stop_block);
                    self.tracker.segment_dirty(epoch).clear(segment_id);
                }
                segment_id += nr_threads;
                continue;
            }
            let lock = &self.segment_locks[(segment_id as usize) & (SEGMENT_LOCKS - 1)];
            lock.acquire();
            let src_base = self.side_segment(src, segment_id, back_id);
            let dst_base = self.side_segment(dst, segment_id, back_id);
            let start_block = segment_id * BLOCKS_PER_SEGMENT;
            let stop_block = self.nr_blocks.min(start_block + BLOCKS_PER_SEGMENT);
            let mut block_id = start_block;
            while block_id < stop_block {
                let mut word = self.tracker.block_dirty(epoch).word(block_id)
                    & !self.tracker.block_dirty(other_epoch).word(block_id);
                while word != 0 {
                    let bit = word.trailing_zeros() as u64;
                    word &= word - 1;
                    let local = (block_id - start_block + bit) as usize * BLOCK_SIZE;
                    // SAFETY: one block between the two arenas.
                    unsafe {
                        nt_copy_eliding(
                            dst_base.add(local),
                            src_base.add(local),
                            BLOCK_SIZE,
                        );
                    }
                }
                block_id += AtomicBitSet::BIT_WIDTH;
            }
            if clear {
                self.tracker
                    .block_dirty(epoch)
                    .clear_range(start_block, stop_block);
                self.tracker.segment_dirty(epoch).clear(segment_id);
            }
            lock.release();
            segment_id += nr_threads;
        }
        store_fence();
    }

    fn checkpoint_inner(&self, nr_threads: u64, comm: Option<&dyn Coordinator>) {
        let tid = self.next_thread_id.fetch_add(1, Ordering::Relaxed) as usize;
        let is_leader = tid == 0;

        // Phase 1: rendezvous; the leader drains the instrumentation rings
        // into the tracker.
        self.barrier.wait(nr_threads as u32, tid);
        if is_leader {
            hook::drain_all_rings();
        }
        std::sync::atomic::fence(Ordering::Release);
        self.barrier.wait(nr_threads as u32, tid);

        // Phase 2: mode selection.
        if is_leader {
            std::sync::atomic::fence(Ordering::Acquire);
            let mut mode = self.determine_flush_mode();
            if mode == FlushMode::NoAction && comm.is_some() {
                // Coordinated ranks must reach the commit barriers together
                // even with nothing to write.
                mode = FlushMode::FlushBlocks;
                self.flush_mode.store(mode as u8, Ordering::Release);
            }
            if mode == FlushMode::NoAction {
                self.next_thread_id.store(0, Ordering::Relaxed);
            } else {
                self.checkpoint_in_progress.store(true, Ordering::Relaxed);
                // Waits for a pending background mirror to drain.
                self.write_back_lock.acquire();
            }
            debug!(?mode, epoch = self.epoch.load(Ordering::Relaxed), "checkpoint mode");
            self.latch.latch_add(tid);
        }
        self.latch.latch_wait(tid);

        let mode = self.current_flush_mode();
        if mode == FlushMode::NoAction {
            return;
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let epoch_idx = (epoch & 1) as usize;
        let target = Side::of_epoch(epoch);

        // Pre-pass: a lossy previous checkpoint may have left its mirror to
        // the background thread; if this checkpoint won the lock first,
        // finish the mirror here. The previous epoch's bits are non-empty
        // exactly while its mirror is outstanding, and they are stable for
        // the duration of the checkpoint, so every participant takes the
        // same branch.
        if self.tracker.segment_dirty(1 - epoch_idx).any() {
            self.mirror_epoch(1 - epoch_idx, tid, nr_threads, false);
            self.barrier.wait(nr_threads as u32, tid);
        }

        // Phase 3: flush caches.
        self.flush_parallel(tid, nr_threads, mode);
        self.barrier.wait(nr_threads as u32, tid);

        // Phase 4: write the dirty blocks into the target arena.
        self.write_back_parallel(tid, nr_threads, mode, epoch_idx, target, true);
        self.barrier.wait(nr_threads as u32, tid);

        // Phase 5: single atomic commit.
        if is_leader {
            self.commit_layout_state(target.state(), comm);
            if !self.has_snapshot.load(Ordering::Relaxed) {
                self.image.set_attributes(ATTR_HAS_SNAPSHOT);
                self.has_snapshot.store(true, Ordering::Relaxed);
            }
            // The previous epoch's mirror completed before phase 4 began.
            self.tracker.clear_epoch(1 - epoch_idx);
            self.latch.latch_add(tid);
        }
        self.latch.latch_wait(tid);

        // Phase 6: mirror and clear.
        match mode {
            FlushMode::FlushBlocks => {
                self.write_back_parallel(
                    tid,
                    nr_threads,
                    mode,
                    epoch_idx,
                    target.opposite(),
                    false,
                );
                self.barrier.wait(nr_threads as u32, tid);
                if is_leader {
                    self.tracker.clear_buffered_bits(epoch_idx);
                    self.finish_checkpoint(epoch);
                    self.latch.latch_add(tid);
                }
            }
            FlushMode::GlobalWriteback => {
                if is_leader {
                    self.finish_checkpoint(epoch);
                    // The just-committed epoch is mirrored in the background.
                    self.background.start();
                    self.latch.latch_add(tid);
                }
            }
            FlushMode::NoAction => unreachable!(),
        }
        std::sync::atomic::fence(Ordering::Release);
        self.latch.latch_wait(tid);
    }

    fn finish_checkpoint(&self, epoch: u64) {
        self.tracker.reset_buffers();
        self.next_thread_id.store(0, Ordering::Relaxed);
        self.checkpoint_in_progress.store(false, Ordering::Relaxed);
        self.epoch.store(1 - (epoch & 1), Ordering::Release);
        self.write_back_lock.release();
    }
}

impl Engine for InstrumentedEngine {
    fn checkpoint(&self, nr_threads: u64) {
        self.checkpoint_inner(nr_threads, None);
    }

    fn checkpoint_coordinated(&self, nr_threads: u64, comm: &dyn Coordinator) {
        self.checkpoint_inner(nr_threads, Some(comm));
    }

    fn exist_snapshot(&self) -> bool {
        self.image.attributes() & ATTR_HAS_SNAPSHOT != 0
    }

    fn base_address(&self) -> *mut u8 {
        self.working
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn wait_for_background_task(&self) {
        self.background.wait_idle();
    }

    fn on_store(&self, addr: usize) {
        let offset = addr - self.working as usize;
        let epoch_idx = (self.epoch.load(Ordering::Acquire) & 1) as usize;
        self.tracker.record(epoch_idx, (offset >> BLOCK_SHIFT) as u64);
    }

    fn on_range_store(&self, addr: usize, len: usize) {
        let offset = addr - self.working as usize;
        let len = len.min(self.capacity - offset);
        let epoch_idx = (self.epoch.load(Ordering::Acquire) & 1) as usize;
        self.tracker.record_range(epoch_idx, offset, len);
    }

    fn committed_epoch(&self) -> u64 {
        self.image.committed_epoch()
    }

    fn segment_state(&self, segment_id: u64) -> Option<SegmentState> {
        if segment_id < self.nr_segments {
            Some(self.image.segment_state(segment_id))
        } else {
            None
        }
    }

    fn has_pending_dirty(&self) -> bool {
        self.tracker.block_dirty(0).any()
            || self.tracker.block_dirty(1).any()
            || self.tracker.segment_dirty(0).any()
            || self.tracker.segment_dirty(1).any()
    }
}

impl Drop for InstrumentedEngine {
    fn drop(&mut self) {
        self.background.shutdown();
        registry::unregister(self.address_range());
        if self.verbose {
            info!(
                traffic_bytes = self.checkpoint_traffic.load(Ordering::Relaxed),
                nr_segments = self.nr_segments,
                nr_blocks = self.nr_blocks,
                "closing instrumented engine"
            );
        }
        // SAFETY: working/capacity describe the anonymous mapping from open.
        unsafe { unmap_anonymous(self.working, self.capacity) };
    }
}
