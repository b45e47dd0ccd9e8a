// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Small reusable thread identifiers.
//!
//! The per-thread buffers in the dirty tracker and the instrumentation rings
//! are indexed by a dense slot id in `0..MAX_THREADS`. A slot is claimed the
//! first time a thread touches the runtime and returned when the thread
//! exits.
//!
//! The allocator is a lock-free bitmap and the claimed slot is cached in a
//! const-initialised thread local, so once a thread is registered the lookup
//! is a plain TLS load with no blocking primitive behind it. The
//! fault-driven engines rely on this: their signal handlers consult the
//! cache through [`try_current_thread_slot`], which never registers, never
//! blocks and never allocates.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::MAX_THREADS;

const SLOT_WORDS: usize = MAX_THREADS / 64;
const UNASSIGNED: usize = usize::MAX;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_WORD: AtomicU64 = AtomicU64::new(0);

static SLOT_BITMAP: [AtomicU64; SLOT_WORDS] = [EMPTY_WORD; SLOT_WORDS];

fn acquire_slot() -> usize {
    for (word_idx, word) in SLOT_BITMAP.iter().enumerate() {
        let mut current = word.load(Ordering::Relaxed);
        while current != u64::MAX {
            let bit = (!current).trailing_zeros() as usize;
            match word.compare_exchange_weak(
                current,
                current | 1 << bit,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return word_idx * 64 + bit,
                Err(seen) => current = seen,
            }
        }
    }
    panic!("more than {MAX_THREADS} live threads entered the runtime");
}

fn release_slot(id: usize) {
    SLOT_BITMAP[id >> 6].fetch_and(!(1u64 << (id & 63)), Ordering::Release);
}

/// Returns the slot to the bitmap when the owning thread exits.
struct SlotReleaser {
    id: usize,
}

impl Drop for SlotReleaser {
    fn drop(&mut self) {
        let _ = SLOT.try_with(|slot| slot.set(UNASSIGNED));
        release_slot(self.id);
    }
}

thread_local! {
    /// Cached slot id. Const-initialised and free of destructors, so a read
    /// compiles down to a plain TLS load.
    static SLOT: Cell<usize> = const { Cell::new(UNASSIGNED) };

    /// Carries the release-on-exit duty. Touched only during registration,
    /// which happens outside any signal context.
    static RELEASER: RefCell<Option<SlotReleaser>> = const { RefCell::new(None) };
}

/// Claim a slot for the calling thread, or return the one it already holds.
/// Must not be called from a signal handler: first-time registration arms
/// the thread-exit release hook.
pub fn register_current_thread() -> usize {
    let cached = SLOT.with(|slot| slot.get());
    if cached != UNASSIGNED {
        return cached;
    }
    let id = acquire_slot();
    SLOT.with(|slot| slot.set(id));
    RELEASER.with(|releaser| {
        *releaser.borrow_mut() = Some(SlotReleaser { id });
    });
    id
}

/// The calling thread's slot id, claimed on first use.
pub fn current_thread_slot() -> usize {
    register_current_thread()
}

/// The calling thread's slot id if one has been claimed. The form signal
/// handlers may use: a plain TLS load, nothing else.
pub fn try_current_thread_slot() -> Option<usize> {
    let cached = SLOT.with(|slot| slot.get());
    if cached == UNASSIGNED {
        None
    } else {
        Some(cached)
    }
}

#[cfg(test)]
mod t_threads {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{mpsc, Mutex};

    #[test]
    fn slot_is_stable_within_a_thread() {
        assert_eq!(current_thread_slot(), current_thread_slot());
    }

    #[test]
    fn unregistered_thread_reports_no_slot() {
        std::thread::spawn(|| {
            assert!(try_current_thread_slot().is_none());
            let id = register_current_thread();
            assert_eq!(try_current_thread_slot(), Some(id));
            assert_eq!(current_thread_slot(), id);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn concurrent_threads_get_distinct_slots() {
        let (tx, rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Arc::new(Mutex::new(release_rx));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tx = tx.clone();
            let release_rx = release_rx.clone();
            handles.push(std::thread::spawn(move || {
                tx.send(current_thread_slot()).unwrap();
                // Hold the slot until every thread has reported.
                let _ = release_rx.lock().unwrap().recv();
            }));
        }
        let mut seen = HashSet::new();
        for _ in 0..8 {
            assert!(seen.insert(rx.recv().unwrap()));
        }
        for _ in 0..8 {
            release_tx.send(()).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
