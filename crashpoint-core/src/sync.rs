// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Synchronisation primitives used by the checkpoint protocol: a reusable
//! sense-reversal barrier with a one-shot latch mode, and a spin flag.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::MAX_THREADS;

/// Reusable sense-reversal barrier.
///
/// Each participating thread keeps a private sense that flips on every use;
/// the last arriver publishes the new sense, everybody else spins on it. The
/// same structure doubles as a one-shot latch: the leader announces with
/// [`Barrier::latch_add`] and followers (and the leader itself) pass through
/// [`Barrier::latch_wait`].
#[repr(align(64))]
pub struct Barrier {
    counter: AtomicU32,
    flag: AtomicU32,
    local_sense: [AtomicU32; MAX_THREADS],
}

impl Barrier {
    pub fn new() -> Self {
        Barrier {
            counter: AtomicU32::new(0),
            flag: AtomicU32::new(0),
            local_sense: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Block until `n` threads have arrived. `tid` indexes the caller's
    /// sense slot and must be unique among the participants.
    pub fn wait(&self, n: u32, tid: usize) {
        let sense = 1 - self.local_sense[tid].load(Ordering::Relaxed);
        self.local_sense[tid].store(sense, Ordering::Relaxed);
        let arrived = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if arrived == n {
            self.counter.store(0, Ordering::Relaxed);
            self.flag.store(sense, Ordering::Release);
        } else {
            while self.flag.load(Ordering::Acquire) != sense {
                std::hint::spin_loop();
            }
        }
    }

    /// Leader-side announcement of the latch. The leader's own sense is not
    /// flipped here; it flips in the paired [`Barrier::latch_wait`].
    pub fn latch_add(&self, tid: usize) {
        let next = 1 - self.local_sense[tid].load(Ordering::Relaxed);
        self.flag.store(next, Ordering::Release);
    }

    /// Wait for the latch to open, flipping the caller's sense.
    pub fn latch_wait(&self, tid: usize) {
        let sense = 1 - self.local_sense[tid].load(Ordering::Relaxed);
        self.local_sense[tid].store(sense, Ordering::Relaxed);
        while self.flag.load(Ordering::Acquire) != sense {
            std::hint::spin_loop();
        }
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Barrier::new()
    }
}

/// Test-and-set spin flag, the moral equivalent of `std::atomic_flag`.
///
/// Acquire/release are explicit rather than guard-based because the
/// checkpoint protocol hands the flag between threads (the leader acquires,
/// the background thread releases).
pub struct SpinFlag {
    locked: AtomicBool,
}

impl SpinFlag {
    pub const fn new() -> Self {
        SpinFlag {
            locked: AtomicBool::new(false),
        }
    }

    pub fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for SpinFlag {
    fn default() -> Self {
        SpinFlag::new()
    }
}
