// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Position-independent pointers.
//!
//! A pptr stores the distance from its own location to its referent, shifted
//! into the upper 48 bits of a 64-bit word. The low 16 bits carry a tag that
//! distinguishes valid pptrs from arbitrary words, encodes the sign of the
//! offset, and leaves the lowest byte free for an ABA stamp in the atomic
//! stamped variant. Because the encoding is self-relative it survives a
//! remap of the heap, and because the tag patterns are fixed the layout is
//! stable on media.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tag pattern for a positive (or null) offset.
pub const PPTR_PATTERN_POSITIVE: u64 = 0xb000;
/// Tag pattern for a negative offset. Bit 0x0100 is the sign bit.
pub const PPTR_PATTERN_NEGATIVE: u64 = 0xb100;
/// Number of tag bits below the magnitude.
pub const PPTR_RESERVED_SHIFT: u32 = 16;
/// Mask selecting the tag bits that participate in validity checks. The
/// lowest byte is excluded so it can carry a stamp.
pub const PPTR_RESERVED_MASK: u64 = 0xfe00;
/// The sign bit inside the tag.
pub const PPTR_SIGN_BIT: u64 = 0x0100;

/// Encoded null: the positive pattern with zero magnitude.
pub const PPTR_NULL_OFF: u64 = PPTR_PATTERN_POSITIVE;

#[inline]
pub fn is_null_off(off: u64) -> bool {
    (off & !0xff) == PPTR_PATTERN_POSITIVE
}

#[inline]
pub fn is_valid_off(off: u64) -> bool {
    (off & PPTR_RESERVED_MASK) == PPTR_PATTERN_POSITIVE
}

/// Encode `target` relative to the pptr cell at `slot`.
pub fn to_off<T>(target: *const T, slot: *const ()) -> u64 {
    if target.is_null() {
        return PPTR_NULL_OFF;
    }
    let target = target as u64;
    let slot = slot as u64;
    if target > slot {
        ((target - slot) << PPTR_RESERVED_SHIFT) | PPTR_PATTERN_POSITIVE
    } else {
        ((slot - target) << PPTR_RESERVED_SHIFT) | PPTR_PATTERN_NEGATIVE
    }
}

/// Decode an offset stored in the pptr cell at `slot`.
pub fn from_off<T>(off: u64, slot: *const ()) -> *mut T {
    if !is_valid_off(off) || is_null_off(off) {
        return std::ptr::null_mut();
    }
    let magnitude = off >> PPTR_RESERVED_SHIFT;
    if off & PPTR_SIGN_BIT != 0 {
        (slot as u64 - magnitude) as *mut T
    } else {
        (slot as u64 + magnitude) as *mut T
    }
}

/// Position-independent pointer for type `T`.
///
/// The value is meaningful only at the address it was stored at; moving the
/// cell without re-encoding invalidates it, so the type is deliberately
/// neither `Copy` nor `Clone`.
#[repr(transparent)]
#[derive(Debug)]
pub struct PPtr<T> {
    off: u64,
    _marker: PhantomData<*mut T>,
}

impl<T> PPtr<T> {
    pub fn null() -> Self {
        PPtr {
            off: PPTR_NULL_OFF,
            _marker: PhantomData,
        }
    }

    pub fn set(&mut self, target: *const T) {
        self.off = to_off(target, self as *const _ as *const ());
    }

    pub fn get(&self) -> *mut T {
        from_off(self.off, self as *const _ as *const ())
    }

    pub fn is_null(&self) -> bool {
        self.off == PPTR_NULL_OFF
    }

    pub fn is_valid(&self) -> bool {
        is_valid_off(self.off)
    }

    pub fn raw_off(&self) -> u64 {
        self.off
    }
}

impl<T> Default for PPtr<T> {
    fn default() -> Self {
        PPtr::null()
    }
}

/// Atomic position-independent pointer.
#[repr(transparent)]
#[derive(Debug)]
pub struct AtomicPPtr<T> {
    off: AtomicU64,
    _marker: PhantomData<*mut T>,
}

impl<T> AtomicPPtr<T> {
    pub fn null() -> Self {
        AtomicPPtr {
            off: AtomicU64::new(PPTR_NULL_OFF),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn slot(&self) -> *const () {
        self as *const _ as *const ()
    }

    pub fn load(&self, order: Ordering) -> *mut T {
        from_off(self.off.load(order), self.slot())
    }

    pub fn store(&self, target: *const T, order: Ordering) {
        self.off.store(to_off(target, self.slot()), order);
    }

    /// Strong compare-exchange in terms of decoded pointers. On failure the
    /// actual pointer is returned.
    pub fn compare_exchange(
        &self,
        current: *const T,
        new: *const T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), *mut T> {
        let cur_off = to_off(current, self.slot());
        let new_off = to_off(new, self.slot());
        match self.off.compare_exchange(cur_off, new_off, success, failure) {
            Ok(_) => Ok(()),
            Err(seen) => Err(from_off(seen, self.slot())),
        }
    }

    /// Weak variant of [`Self::compare_exchange`]; may fail spuriously.
    pub fn compare_exchange_weak(
        &self,
        current: *const T,
        new: *const T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), *mut T> {
        let cur_off = to_off(current, self.slot());
        let new_off = to_off(new, self.slot());
        match self
            .off
            .compare_exchange_weak(cur_off, new_off, success, failure)
        {
            Ok(_) => Ok(()),
            Err(seen) => Err(from_off(seen, self.slot())),
        }
    }
}

/// Atomic position-independent pointer carrying an 8-bit stamp in the low
/// byte of the tag for ABA protection.
#[repr(transparent)]
#[derive(Debug)]
pub struct AtomicStampedPPtr<T> {
    off: AtomicU64,
    _marker: PhantomData<*mut T>,
}

impl<T> AtomicStampedPPtr<T> {
    pub fn null() -> Self {
        AtomicStampedPPtr {
            off: AtomicU64::new(PPTR_NULL_OFF),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn slot(&self) -> *const () {
        self as *const _ as *const ()
    }

    pub fn load(&self, order: Ordering) -> (*mut T, u8) {
        let off = self.off.load(order);
        (from_off(off, self.slot()), (off & 0xff) as u8)
    }

    pub fn store(&self, target: *const T, stamp: u8, order: Ordering) {
        self.off
            .store(to_off(target, self.slot()) | u64::from(stamp), order);
    }

    /// Strong compare-exchange over (pointer, stamp) pairs. On failure the
    /// observed pair is returned.
    pub fn compare_exchange(
        &self,
        current: (*const T, u8),
        new: (*const T, u8),
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), (*mut T, u8)> {
        let cur_off = to_off(current.0, self.slot()) | u64::from(current.1);
        let new_off = to_off(new.0, self.slot()) | u64::from(new.1);
        match self.off.compare_exchange(cur_off, new_off, success, failure) {
            Ok(_) => Ok(()),
            Err(seen) => Err((from_off(seen, self.slot()), (seen & 0xff) as u8)),
        }
    }

    /// Weak variant of [`Self::compare_exchange`]; may fail spuriously.
    pub fn compare_exchange_weak(
        &self,
        current: (*const T, u8),
        new: (*const T, u8),
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), (*mut T, u8)> {
        let cur_off = to_off(current.0, self.slot()) | u64::from(current.1);
        let new_off = to_off(new.0, self.slot()) | u64::from(new.1);
        match self
            .off
            .compare_exchange_weak(cur_off, new_off, success, failure)
        {
            Ok(_) => Ok(()),
            Err(seen) => Err((from_off(seen, self.slot()), (seen & 0xff) as u8)),
        }
    }
}
