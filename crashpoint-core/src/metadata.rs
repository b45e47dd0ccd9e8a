// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Single-epoch mirror image.
//!
//! The mprotect and soft-dirty engines do not need the segment-granular
//! state machine of the dual-epoch image: their whole heap flips between two
//! full-size copies. The header's `consistent_side` field plays the role of
//! `committed_epoch`: whichever side it names holds the last committed
//! checkpoint in its entirety.
//!
//! Layout: a huge-page header followed by the main copy and the back copy,
//! each `capacity` bytes.

use crate::persist::{flush_range, nt_copy_eliding, nt_store_u32, store_fence};
use crate::pptr::PPtr;
use crate::{Error, HUGE_PAGE_SIZE};

pub const MIRROR_MAGIC: u32 = 0x6f6f0101;

/// Attribute flag: the image holds at least one committed checkpoint.
pub const MIRROR_ATTR_HAS_SNAPSHOT: u32 = 0x10;

/// Which copy holds the last committed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConsistentSide {
    Main = 1,
    Back = 2,
}

#[repr(C)]
struct MirrorHeader {
    magic: u32,
    checksum: u32,
    attributes: u32,
    consistent_side: u32,
    capacity: u64,
    main_data: PPtr<u8>,
    back_data: PPtr<u8>,
    padding: [u64; 3],
}

/// Mirror image handle over a mapped file.
#[derive(Debug)]
pub struct MirrorImage {
    header: *mut MirrorHeader,
}

// SAFETY: mutation is serialised by the engine protocol (leader-only).
unsafe impl Send for MirrorImage {}
unsafe impl Sync for MirrorImage {}

fn header_checksum(header: &MirrorHeader) -> u32 {
    // The checksum field itself is zero while the digest is taken.
    let mut hasher = crc32fast::Hasher::new();
    let bytes = unsafe {
        std::slice::from_raw_parts(
            (header as *const MirrorHeader).cast::<u8>(),
            std::mem::size_of::<MirrorHeader>(),
        )
    };
    hasher.update(&bytes[..4]);
    hasher.update(&[0, 0, 0, 0]);
    hasher.update(&bytes[8..]);
    hasher.finalize()
}

impl MirrorImage {
    /// Total file size for a heap of `capacity` bytes.
    pub fn layout_size(capacity: usize) -> usize {
        HUGE_PAGE_SIZE + 2 * capacity
    }

    /// Initialise a fresh mirror image in the mapping at `base`.
    pub fn create(base: *mut u8, capacity: usize) -> Result<MirrorImage, Error> {
        if capacity == 0 {
            return Err(Error::CapacityInvalid);
        }
        let header = base.cast::<MirrorHeader>();
        // SAFETY: the caller maps layout_size(capacity) bytes at base.
        unsafe {
            std::ptr::write_bytes(header.cast::<u8>(), 0, std::mem::size_of::<MirrorHeader>());
            (*header).magic = MIRROR_MAGIC;
            (*header).capacity = capacity as u64;
            (*header).consistent_side = ConsistentSide::Back as u32;
            (*header).main_data.set(base.add(HUGE_PAGE_SIZE));
            (*header).back_data.set(base.add(HUGE_PAGE_SIZE + capacity));
            flush_range(base, std::mem::size_of::<MirrorHeader>());
            store_fence();
            let checksum = header_checksum(&*header);
            nt_store_u32(std::ptr::addr_of_mut!((*header).checksum), checksum);
        }
        store_fence();
        Ok(MirrorImage { header })
    }

    /// Open an existing mirror image, verifying magic and checksum.
    pub fn open(base: *mut u8) -> Result<MirrorImage, Error> {
        let header = base.cast::<MirrorHeader>();
        // SAFETY: the caller maps at least a header at base.
        unsafe {
            if (*header).magic != MIRROR_MAGIC {
                return Err(Error::MagicMismatch);
            }
            if (*header).checksum != header_checksum(&*header) {
                return Err(Error::SegmentMalformed);
            }
            if (*header).capacity == 0 {
                return Err(Error::CapacityInvalid);
            }
        }
        Ok(MirrorImage { header })
    }

    pub fn capacity(&self) -> usize {
        // SAFETY: header is a live mapping.
        unsafe { (*self.header).capacity as usize }
    }

    pub fn main_data(&self) -> *mut u8 {
        // SAFETY: header is a live mapping.
        unsafe { (*self.header).main_data.get() }
    }

    pub fn back_data(&self) -> *mut u8 {
        // SAFETY: header is a live mapping.
        unsafe { (*self.header).back_data.get() }
    }

    pub fn consistent_side(&self) -> ConsistentSide {
        // SAFETY: header is a live mapping.
        let raw = unsafe { std::ptr::addr_of!((*self.header).consistent_side).read_volatile() };
        if raw == ConsistentSide::Main as u32 {
            ConsistentSide::Main
        } else {
            ConsistentSide::Back
        }
    }

    /// Advance the commit point: one non-temporal store plus fence.
    pub fn set_consistent_side(&self, side: ConsistentSide) {
        // SAFETY: header is a live mapping.
        unsafe {
            nt_store_u32(
                std::ptr::addr_of_mut!((*self.header).consistent_side),
                side as u32,
            );
        }
        store_fence();
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

    /// After a crash, restore the invariant "back holds the committed
    /// checkpoint": if the commit point names the main side, propagate it to
    /// back and flip; otherwise restore main from back.
    pub fn recover_data(&self) {
        let capacity = self.capacity();
        match self.consistent_side() {
            ConsistentSide::Main => {
                // SAFETY: both copies are capacity bytes, cache-line aligned.
                unsafe { nt_copy_eliding(self.back_data(), self.main_data(), capacity) };
                store_fence();
                self.set_consistent_side(ConsistentSide::Back);
            }
            ConsistentSide::Back => {
                // SAFETY: as above.
                unsafe { nt_copy_eliding(self.main_data(), self.back_data(), capacity) };
                store_fence();
            }
        }
    }
}

#[cfg(test)]
mod t_metadata {
    use super::*;
    use crate::mapping::{map_anonymous, unmap_anonymous};

    const CAPACITY: usize = 4 << 20;

    struct Arena {
        base: *mut u8,
        len: usize,
    }

    impl Arena {
        fn new() -> Arena {
            let len = MirrorImage::layout_size(CAPACITY);
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
    fn create_then_open() {
        let arena = Arena::new();
        let image = MirrorImage::create(arena.base, CAPACITY).expect("create");
        assert_eq!(image.consistent_side(), ConsistentSide::Back);
        assert_eq!(image.capacity(), CAPACITY);
        drop(image);

        let image = MirrorImage::open(arena.base).expect("open");
        assert_eq!(image.capacity(), CAPACITY);
        assert_eq!(
            image.main_data() as usize - arena.base as usize,
            HUGE_PAGE_SIZE
        );
        assert_eq!(
            image.back_data() as usize - image.main_data() as usize,
            CAPACITY
        );
    }

    #[test]
    fn open_rejects_corruption() {
        let arena = Arena::new();
        MirrorImage::create(arena.base, CAPACITY).expect("create");
        // Corrupt the capacity field behind the checksum's back.
        unsafe { arena.base.add(16).write(0xff) };
        assert_eq!(
            MirrorImage::open(arena.base).unwrap_err(),
            Error::SegmentMalformed
        );
        // And a wrong magic dominates.
        unsafe { arena.base.write(0) };
        assert_eq!(
            MirrorImage::open(arena.base).unwrap_err(),
            Error::MagicMismatch
        );
    }

    #[test]
    fn recover_from_main_side_flips_to_back() {
        let arena = Arena::new();
        let image = MirrorImage::create(arena.base, CAPACITY).expect("create");
        unsafe {
            image.main_data().write_bytes(0x11, CAPACITY);
            image.back_data().write_bytes(0x22, CAPACITY);
        }
        // Crash happened after phase (a): main holds the new checkpoint.
        image.set_consistent_side(ConsistentSide::Main);
        image.recover_data();
        assert_eq!(image.consistent_side(), ConsistentSide::Back);
        unsafe {
            assert_eq!(image.main_data().read(), 0x11);
            assert_eq!(image.back_data().read(), 0x11);
        }
    }

    #[test]
    fn recover_from_back_side_restores_main() {
        let arena = Arena::new();
        let image = MirrorImage::create(arena.base, CAPACITY).expect("create");
        unsafe {
            image.main_data().write_bytes(0x33, CAPACITY);
            image.back_data().write_bytes(0x44, CAPACITY);
        }
        // Crash happened mid phase (a): back still holds the checkpoint.
        image.recover_data();
        unsafe {
            assert_eq!(image.main_data().read(), 0x44);
            assert_eq!(image.back_data().read(), 0x44);
        }
    }
}
