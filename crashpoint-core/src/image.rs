// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Dual-epoch checkpoint image.
//!
//! On-media layout, all fields little-endian on the media:
//!
//! ```text
//! header        { magic, attributes, nr_main_segments, nr_back_segments,
//!                 committed_epoch, media_error }
//! state_vec[0]  u8 x nr_main_segments, cache-line padded
//! state_vec[1]  u8 x nr_main_segments, cache-line padded
//! back_to_main  u64 x nr_back_segments (u64::MAX = unbound)
//! ...           region above rounded to a huge page, then duplicated
//!               (primary + shadow)
//! main arena    nr_main_segments x SEGMENT_SIZE
//! back arena    nr_back_segments x SEGMENT_SIZE
//! ```
//!
//! The vector selected by `committed_epoch & 1` is authoritative; the other
//! is scratch for the next commit. Advancing `committed_epoch` with a single
//! non-temporal store is the commit point: a crash anywhere in the update
//! sequence recovers to either the old or the new vector, never a blend.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::persist::{
    flush, flush_range, nt_copy, nt_copy_eliding, nt_store_u32, nt_store_u64, round_up, store_fence,
};
use crate::{Error, CACHE_LINE_SIZE, HUGE_PAGE_SIZE, NULL_SEGMENT, SEGMENT_SIZE};

pub const IMAGE_MAGIC: u32 = 0x6f6f0202;

/// Attribute flag: the image holds at least one committed checkpoint.
pub const ATTR_HAS_SNAPSHOT: u32 = 0x10;

/// Per-segment state recorded in the state vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentState {
    /// Never written since the image was created.
    Initial = 0,
    /// The authoritative content lives in the main segment.
    Main = 1,
    /// The authoritative content lives in the bound back segment.
    Back = 2,
    /// Both copies are equal; either may be read.
    Identical = 3,
}

impl SegmentState {
    pub fn from_u8(value: u8) -> Result<SegmentState, Error> {
        match value {
            0 => Ok(SegmentState::Initial),
            1 => Ok(SegmentState::Main),
            2 => Ok(SegmentState::Back),
            3 => Ok(SegmentState::Identical),
            _ => Err(Error::SegmentMalformed),
        }
    }
}

#[repr(C)]
struct ImageHeader {
    magic: u32,
    attributes: u32,
    nr_main_segments: u64,
    nr_back_segments: u64,
    committed_epoch: u64,
    media_error: u64,
}

/// The persistent checkpoint artefact plus its volatile indexes.
#[derive(Debug)]
pub struct CheckpointImage {
    header: *mut ImageHeader,
    state_vec: [*mut u8; 2],
    back_to_main: *mut u64,
    header_size: usize,
    header_shadow: *mut u8,
    main_memory: *mut u8,
    back_memory: *mut u8,
    nr_main: u64,
    nr_back: u64,
    /// Volatile inverse of `back_to_main`, rebuilt at open.
    main_to_back_idx: Box<[AtomicU64]>,
}

// SAFETY: concurrent mutation of the mapped bytes is governed by the
// checkpoint protocol (leader-only commits, per-segment spin locks).
unsafe impl Send for CheckpointImage {}
unsafe impl Sync for CheckpointImage {}

struct Layout {
    state_vec: [usize; 2],
    back_to_main: usize,
    header_size: usize,
}

fn layout(nr_main: u64, nr_back: u64) -> Layout {
    let mut offset = round_up(std::mem::size_of::<ImageHeader>(), CACHE_LINE_SIZE);
    let state0 = offset;
    offset += round_up(nr_main as usize, CACHE_LINE_SIZE);
    let state1 = offset;
    offset += round_up(nr_main as usize, CACHE_LINE_SIZE);
    let back_to_main = offset;
    offset += round_up(nr_back as usize * 8, CACHE_LINE_SIZE);
    Layout {
        state_vec: [state0, state1],
        back_to_main,
        header_size: round_up(offset, HUGE_PAGE_SIZE),
    }
}

impl CheckpointImage {
    /// Size of the header region: primary plus shadow copy.
    pub fn header_region_size(nr_main: u64, nr_back: u64) -> usize {
        layout(nr_main, nr_back).header_size * 2
    }

    /// Total image file size.
    pub fn file_size(nr_main: u64, nr_back: u64) -> usize {
        Self::header_region_size(nr_main, nr_back) + (nr_main + nr_back) as usize * SEGMENT_SIZE
    }

    fn assemble(base: *mut u8, nr_main: u64, nr_back: u64) -> CheckpointImage {
        let l = layout(nr_main, nr_back);
        let main_to_back_idx = (0..nr_main).map(|_| AtomicU64::new(NULL_SEGMENT)).collect();
        // SAFETY: all offsets are inside the mapped file by construction.
        unsafe {
            CheckpointImage {
                header: base.cast(),
                state_vec: [base.add(l.state_vec[0]), base.add(l.state_vec[1])],
                back_to_main: base.add(l.back_to_main).cast(),
                header_size: l.header_size,
                header_shadow: base.add(l.header_size),
                main_memory: base.add(l.header_size * 2),
                back_memory: base.add(l.header_size * 2 + nr_main as usize * SEGMENT_SIZE),
                nr_main,
                nr_back,
                main_to_back_idx,
            }
        }
    }

    /// Initialise a fresh image in the mapping at `base`: header, zeroed
    /// state vectors, sequential initial back bindings, flushed and fenced.
    pub fn create(base: *mut u8, nr_main: u64, nr_back: u64) -> Result<CheckpointImage, Error> {
        if nr_main == 0 || nr_back == 0 || nr_back > nr_main {
            return Err(Error::CapacityInvalid);
        }
        let image = Self::assemble(base, nr_main, nr_back);
        // SAFETY: the layout fits the mapping sized by file_size().
        unsafe {
            let header = &mut *image.header;
            header.magic = IMAGE_MAGIC;
            header.attributes = 0;
            header.nr_main_segments = nr_main;
            header.nr_back_segments = nr_back;
            header.committed_epoch = 0;
            header.media_error = 0;
            std::ptr::write_bytes(image.state_vec[0], SegmentState::Initial as u8, nr_main as usize);
            std::ptr::write_bytes(image.state_vec[1], SegmentState::Initial as u8, nr_main as usize);
            for back_id in 0..nr_back {
                image.back_to_main.add(back_id as usize).write(back_id);
            }
            flush_range(base, image.header_size);
        }
        store_fence();

        for back_id in 0..nr_back {
            image.main_to_back_idx[back_id as usize].store(back_id, Ordering::Relaxed);
        }
        Ok(image)
    }

    /// Open an existing image, verifying the magic and rebuilding the
    /// volatile main->back index from the persistent back->main array.
    pub fn open(base: *mut u8) -> Result<CheckpointImage, Error> {
        // SAFETY: the caller maps at least a header at base.
        let (magic, nr_main, nr_back) = unsafe {
            let header = &*base.cast::<ImageHeader>();
            (header.magic, header.nr_main_segments, header.nr_back_segments)
        };
        if magic != IMAGE_MAGIC {
            return Err(Error::MagicMismatch);
        }
        if nr_main == 0 || nr_back == 0 || nr_back > nr_main {
            return Err(Error::SegmentMalformed);
        }

        let image = Self::assemble(base, nr_main, nr_back);
        for back_id in 0..nr_back {
            let main_id = image.back_to_main(back_id);
            if main_id != NULL_SEGMENT {
                if main_id >= nr_main {
                    return Err(Error::SegmentMalformed);
                }
                image.main_to_back_idx[main_id as usize].store(back_id, Ordering::Relaxed);
            }
        }
        Ok(image)
    }

    pub fn nr_main_segments(&self) -> u64 {
        self.nr_main
    }

    pub fn nr_back_segments(&self) -> u64 {
        self.nr_back
    }

    pub fn committed_epoch(&self) -> u64 {
        // SAFETY: header is a live mapping.
        unsafe { std::ptr::addr_of!((*self.header).committed_epoch).read_volatile() }
    }

    pub fn attributes(&self) -> u32 {
        // SAFETY: header is a live mapping.
        unsafe { std::ptr::addr_of!((*self.header).attributes).read_volatile() }
    }

    pub fn set_attributes(&self, value: u32) {
        // SAFETY: header is a live mapping.
        unsafe {
            nt_store_u32(std::ptr::addr_of_mut!((*self.header).attributes), value);
        }
        store_fence();
    }

    /// Roll the commit point backwards (or forwards). Used only by the
    /// coordinated open to align every process on the minimum epoch before
    /// recovery.
    pub fn reset_committed_epoch(&self, epoch: u64) {
        // SAFETY: header is a live mapping.
        unsafe {
            nt_store_u64(std::ptr::addr_of_mut!((*self.header).committed_epoch), epoch);
        }
        store_fence();
    }

    pub fn main_segment(&self, segment_id: u64) -> *mut u8 {
        debug_assert!(segment_id < self.nr_main);
        // SAFETY: bounded by the arena size.
        unsafe { self.main_memory.add(segment_id as usize * SEGMENT_SIZE) }
    }

    pub fn back_segment(&self, back_id: u64) -> *mut u8 {
        debug_assert!(back_id < self.nr_back);
        // SAFETY: bounded by the arena size.
        unsafe { self.back_memory.add(back_id as usize * SEGMENT_SIZE) }
    }

    pub fn main_block(&self, block_id: u64) -> *mut u8 {
        // SAFETY: bounded by the arena size.
        unsafe { self.main_memory.add(block_id as usize * crate::BLOCK_SIZE) }
    }

    pub fn back_block(&self, block_id: u64) -> *mut u8 {
        // SAFETY: bounded by the arena size.
        unsafe { self.back_memory.add(block_id as usize * crate::BLOCK_SIZE) }
    }

    pub fn start_address(&self) -> *mut u8 {
        self.header.cast()
    }

    pub fn end_address(&self) -> *mut u8 {
        // SAFETY: computes one-past-the-end of the mapping.
        unsafe {
            self.start_address()
                .add(Self::file_size(self.nr_main, self.nr_back))
        }
    }

    pub fn back_to_main(&self, back_id: u64) -> u64 {
        debug_assert!(back_id < self.nr_back);
        // SAFETY: bounded index into the persistent array.
        unsafe { self.back_to_main.add(back_id as usize).read_volatile() }
    }

    pub fn main_to_back(&self, main_id: u64) -> u64 {
        self.main_to_back_idx[main_id as usize].load(Ordering::Relaxed)
    }

    /// Persist a new back->main binding and update the volatile inverse.
    /// Callers serialise on the engine's back-allocation lock.
    pub fn bind_back_segment(&self, main_id: u64, back_id: u64) {
        let old_main = self.back_to_main(back_id);
        if old_main != NULL_SEGMENT {
            self.main_to_back_idx[old_main as usize].store(NULL_SEGMENT, Ordering::Relaxed);
        }
        // SAFETY: bounded index; the array lives in the mapping.
        unsafe {
            nt_store_u64(self.back_to_main.add(back_id as usize), main_id);
        }
        self.main_to_back_idx[main_id as usize].store(back_id, Ordering::Relaxed);
        store_fence();
    }

    /// Authoritative state of a segment.
    pub fn segment_state(&self, segment_id: u64) -> SegmentState {
        debug_assert!(segment_id < self.nr_main);
        let authoritative = (self.committed_epoch() & 1) as usize;
        // SAFETY: bounded index into the live vector.
        let raw = unsafe { self.state_vec[authoritative].add(segment_id as usize).read_volatile() };
        SegmentState::from_u8(raw).unwrap_or(SegmentState::Initial)
    }

    /// Write a state into both vectors immediately, outside a commit. Used
    /// by the copy-on-write protection path, under the segment's spin lock.
    pub fn set_segment_state_atomic(&self, segment_id: u64, state: SegmentState) {
        let authoritative = (self.committed_epoch() & 1) as usize;
        // SAFETY: bounded indexes into the live vectors.
        unsafe {
            let slot = self.state_vec[authoritative].add(segment_id as usize);
            slot.write_volatile(state as u8);
            flush(slot);
            store_fence();
            let slot = self.state_vec[1 - authoritative].add(segment_id as usize);
            slot.write_volatile(state as u8);
            flush(slot);
        }
    }

    /// Begin an epoch-flip state update. All writes go to the scratch vector
    /// until [`StateUpdate::commit`] advances the epoch.
    pub fn begin_state_update(&self) -> StateUpdate<'_> {
        let lines = (round_up(self.nr_main as usize, CACHE_LINE_SIZE)) / CACHE_LINE_SIZE;
        StateUpdate {
            image: self,
            dirty_lines: vec![false; lines],
        }
    }

    /// After a crash, make both sides of every bound, non-initial segment
    /// identical again (copying from the authoritative side) and commit the
    /// requested state for all of them.
    pub fn recovery(&self, to_state: SegmentState) {
        let mut update = self.begin_state_update();
        let authoritative = (self.committed_epoch() & 1) as usize;
        for back_id in 0..self.nr_back {
            let main_id = self.back_to_main(back_id);
            if main_id == NULL_SEGMENT {
                continue;
            }
            // SAFETY: bounded index into the live vector.
            let raw = unsafe { self.state_vec[authoritative].add(main_id as usize).read_volatile() };
            let state = SegmentState::from_u8(raw).unwrap_or(SegmentState::Initial);
            if state == SegmentState::Initial {
                continue;
            }
            let main = self.main_segment(main_id);
            let back = self.back_segment(back_id);
            // SAFETY: both sides are SEGMENT_SIZE, cache-line aligned.
            unsafe {
                match state {
                    SegmentState::Main => nt_copy_eliding(back, main, SEGMENT_SIZE),
                    SegmentState::Back => nt_copy_eliding(main, back, SEGMENT_SIZE),
                    SegmentState::Identical | SegmentState::Initial => {}
                }
            }
            if state != to_state {
                update.set(main_id, to_state);
            }
        }
        update.commit();
    }
}

/// In-progress segment-state update. Writes land in the scratch vector and
/// become visible only through [`StateUpdate::commit`].
pub struct StateUpdate<'a> {
    image: &'a CheckpointImage,
    dirty_lines: Vec<bool>,
}

impl StateUpdate<'_> {
    /// Stage a state for `segment_id` in the scratch vector.
    pub fn set(&mut self, segment_id: u64, state: SegmentState) {
        debug_assert!(segment_id < self.image.nr_main);
        let scratch = 1 - (self.image.committed_epoch() & 1) as usize;
        // SAFETY: bounded index into the live scratch vector.
        unsafe {
            let slot = self.image.state_vec[scratch].add(segment_id as usize);
            if slot.read_volatile() != state as u8 {
                slot.write_volatile(state as u8);
                self.dirty_lines[segment_id as usize / CACHE_LINE_SIZE] = true;
            }
        }
    }

    /// Flush the staged lines, advance the commit point, then propagate the
    /// new vector into what becomes the next scratch.
    pub fn commit(self) {
        self.commit_inner(None);
    }

    /// Like [`StateUpdate::commit`], invoking `barrier` between the epoch
    /// advance and the propagation so that coordinated processes flip
    /// together.
    pub fn commit_with_barrier(self, barrier: &dyn Fn()) {
        self.commit_inner(Some(barrier));
    }

    fn commit_inner(self, barrier: Option<&dyn Fn()>) {
        let image = self.image;
        let next_epoch = image.committed_epoch() + 1;
        let becomes_authoritative = (next_epoch & 1) as usize;
        // SAFETY: line offsets are bounded by the padded vector size.
        unsafe {
            for (line, dirty) in self.dirty_lines.iter().enumerate() {
                if *dirty {
                    flush(image.state_vec[becomes_authoritative].add(line * CACHE_LINE_SIZE));
                }
            }
            store_fence();
            nt_store_u64(
                std::ptr::addr_of_mut!((*image.header).committed_epoch),
                next_epoch,
            );
            store_fence();
            if let Some(barrier) = barrier {
                barrier();
            }
            for (line, dirty) in self.dirty_lines.iter().enumerate() {
                if *dirty {
                    nt_copy(
                        image.state_vec[1 - becomes_authoritative].add(line * CACHE_LINE_SIZE),
                        image.state_vec[becomes_authoritative].add(line * CACHE_LINE_SIZE),
                        CACHE_LINE_SIZE,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod t_image {
    use super::*;
    use crate::mapping::{map_anonymous, unmap_anonymous};

    const NR_MAIN: u64 = 64;
    const NR_BACK: u64 = 16;

    struct Arena {
        base: *mut u8,
        len: usize,
    }

    impl Arena {
        fn new() -> Arena {
            let len = CheckpointImage::file_size(NR_MAIN, NR_BACK);
            Arena {
                base: map_anonymous(len, None).expect("arena"),
                len,
            }
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            unsafe { unmap_anonymous(self.base, self.len) };
        }
    }

    #[test]
    fn layout_is_huge_page_rounded_and_doubled() {
        let header = CheckpointImage::header_region_size(NR_MAIN, NR_BACK);
        assert_eq!(header, 2 * crate::HUGE_PAGE_SIZE);
        assert_eq!(
            CheckpointImage::file_size(NR_MAIN, NR_BACK),
            header + (NR_MAIN + NR_BACK) as usize * SEGMENT_SIZE
        );
    }

    #[test]
    fn create_binds_back_slots_sequentially() {
        let arena = Arena::new();
        let image = CheckpointImage::create(arena.base, NR_MAIN, NR_BACK).expect("create");
        assert_eq!(image.committed_epoch(), 0);
        for back_id in 0..NR_BACK {
            assert_eq!(image.back_to_main(back_id), back_id);
            assert_eq!(image.main_to_back(back_id), back_id);
        }
        for main_id in NR_BACK..NR_MAIN {
            assert_eq!(image.main_to_back(main_id), NULL_SEGMENT);
        }
        assert_eq!(image.segment_state(0), SegmentState::Initial);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let arena = Arena::new();
        assert_eq!(
            CheckpointImage::open(arena.base).unwrap_err(),
            Error::MagicMismatch
        );
    }

    /// A foreign file whose header happens to parse as integers must still
    /// be rejected by the magic check.
    #[test]
    fn open_rejects_crafted_foreign_header() {
        use byteorder::{NativeEndian, WriteBytesExt};
        use crate::mapping::FileMapping;

        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("foreign");
        {
            let mut file = std::fs::File::create(&path).expect("create file");
            file.write_u32::<NativeEndian>(0xdeadbeef).expect("magic");
            file.write_u32::<NativeEndian>(0).expect("attributes");
            file.write_u64::<NativeEndian>(NR_MAIN).expect("nr_main");
            file.write_u64::<NativeEndian>(NR_BACK).expect("nr_back");
            file.write_u64::<NativeEndian>(7).expect("epoch");
            file.write_u64::<NativeEndian>(0).expect("media_error");
            file.set_len(4096).expect("extend");
            file.sync_all().expect("sync");
        }
        let mapping = FileMapping::open(&path, None).expect("map");
        assert_eq!(
            CheckpointImage::open(mapping.base()).unwrap_err(),
            Error::MagicMismatch
        );
    }

    #[test]
    fn open_rebuilds_inverse_index() {
        let arena = Arena::new();
        let image = CheckpointImage::create(arena.base, NR_MAIN, NR_BACK).expect("create");
        image.bind_back_segment(40, 3);
        drop(image);

        let image = CheckpointImage::open(arena.base).expect("open");
        assert_eq!(image.back_to_main(3), 40);
        assert_eq!(image.main_to_back(40), 3);
        // Slot 3's previous main lost its shadow.
        assert_eq!(image.main_to_back(3), NULL_SEGMENT);
    }

    /// Back-slot monogamy: for every bound slot b,
    /// `main_to_back[back_to_main[b]] == b`.
    #[test]
    fn bind_keeps_monogamy() {
        let arena = Arena::new();
        let image = CheckpointImage::create(arena.base, NR_MAIN, NR_BACK).expect("create");
        // Steal slots the way the allocator does: each main segment is bound
        // at most once, slots move between mains.
        image.bind_back_segment(20, 0);
        image.bind_back_segment(41, 5);
        image.bind_back_segment(63, 0);
        for back_id in 0..NR_BACK {
            let main_id = image.back_to_main(back_id);
            if main_id != NULL_SEGMENT && image.main_to_back(main_id) != NULL_SEGMENT {
                assert_eq!(image.main_to_back(main_id), back_id);
            }
        }
        assert_eq!(image.main_to_back(63), 0);
        assert_eq!(image.main_to_back(41), 5);
        // Main 20 lost its shadow when slot 0 was rebound.
        assert_eq!(image.main_to_back(20), NULL_SEGMENT);
    }

    #[test]
    fn staged_states_are_invisible_until_commit() {
        let arena = Arena::new();
        let image = CheckpointImage::create(arena.base, NR_MAIN, NR_BACK).expect("create");

        let mut update = image.begin_state_update();
        update.set(7, SegmentState::Back);
        // Crash before commit: the authoritative vector still reads Initial.
        assert_eq!(image.segment_state(7), SegmentState::Initial);
        drop(update);
        assert_eq!(image.committed_epoch(), 0);

        let mut update = image.begin_state_update();
        update.set(7, SegmentState::Back);
        update.commit();
        assert_eq!(image.committed_epoch(), 1);
        assert_eq!(image.segment_state(7), SegmentState::Back);

        // After the commit both vectors agree, so flipping the epoch by hand
        // does not change the observed state.
        image.reset_committed_epoch(2);
        assert_eq!(image.segment_state(7), SegmentState::Back);
    }

    #[test]
    fn recovery_equalises_sides_and_is_idempotent() {
        let arena = Arena::new();
        let image = CheckpointImage::create(arena.base, NR_MAIN, NR_BACK).expect("create");

        // Pretend a checkpoint committed segment 5 on the back side.
        unsafe {
            image.main_segment(5).write_bytes(0xaa, SEGMENT_SIZE);
            image.back_segment(5).write_bytes(0xbb, SEGMENT_SIZE);
        }
        let mut update = image.begin_state_update();
        update.set(5, SegmentState::Back);
        update.commit();

        image.recovery(SegmentState::Main);
        // The authoritative (back) bytes won.
        unsafe {
            assert_eq!(image.main_segment(5).read(), 0xbb);
            assert_eq!(image.back_segment(5).read(), 0xbb);
        }
        assert_eq!(image.segment_state(5), SegmentState::Main);
        let epoch = image.committed_epoch();

        // Idempotent: a second recovery changes nothing observable.
        image.recovery(SegmentState::Main);
        unsafe {
            assert_eq!(image.main_segment(5).read(), 0xbb);
            assert_eq!(image.back_segment(5).read(), 0xbb);
        }
        assert_eq!(image.segment_state(5), SegmentState::Main);
        assert_eq!(image.committed_epoch(), epoch + 1);
    }

    #[test]
    fn attributes_round_trip() {
        let arena = Arena::new();
        let image = CheckpointImage::create(arena.base, NR_MAIN, NR_BACK).expect("create");
        assert_eq!(image.attributes() & ATTR_HAS_SNAPSHOT, 0);
        image.set_attributes(ATTR_HAS_SNAPSHOT);
        assert_eq!(image.attributes(), ATTR_HAS_SNAPSHOT);
    }
}
