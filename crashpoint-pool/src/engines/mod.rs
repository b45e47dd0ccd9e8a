// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! The engine variants.

pub mod dirtybit;
pub mod instrumented;
pub mod mprotect;
pub mod noop;
pub mod nvm;

use crashpoint_core::{MIN_POOL_SIZE, SEGMENT_MASK, SEGMENT_SIZE};

use crate::PoolOptions;

/// Resolve the working-heap capacity for a freshly created pool: at least
/// the minimum container size, rounded up to whole segments.
pub(crate) fn create_capacity(options: &PoolOptions) -> usize {
    let mut capacity = options.capacity.max(MIN_POOL_SIZE);
    if capacity & SEGMENT_MASK != 0 {
        capacity = (capacity & !SEGMENT_MASK) + SEGMENT_SIZE;
    }
    capacity
}

/// The fixed base for the working heap, if any.
pub(crate) fn fixed_base(options: &PoolOptions) -> Option<usize> {
    if options.fixed_base_address != 0 {
        Some(options.fixed_base_address)
    } else {
        None
    }
}
