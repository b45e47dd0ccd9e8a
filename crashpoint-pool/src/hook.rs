// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Instrumentation runtime boundary.
//!
//! A compiler pass (out of scope here) inserts calls to the extern "C"
//! entry points below for every store the mutator performs. Each thread
//! buffers raw addresses in a fixed 120-slot ring; the ring drains through
//! the engine registry when it fills, and the checkpoint leader drains every
//! ring at the rendezvous. Addresses outside any registered heap (stack
//! spills in particular) fall out during the drain.

use std::cell::UnsafeCell;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crashpoint_core::sync::SpinFlag;
use crashpoint_core::threads::{current_thread_slot, register_current_thread};
use crashpoint_core::{BLOCK_MASK, BLOCK_SIZE, MAX_THREADS};

use crate::registry;

/// Capacity of the per-thread address ring.
pub const ADDRESS_RING_CAPACITY: usize = 120;

#[repr(C, align(1024))]
struct AddressRing {
    len: AtomicU64,
    lock: SpinFlag,
    _pad: [u64; 6],
    slots: UnsafeCell<[u64; ADDRESS_RING_CAPACITY]>,
}

// SAFETY: slots are written by the owning thread only; drains take the lock
// and happen either on the owner or with every mutator parked in the
// checkpoint rendezvous.
unsafe impl Sync for AddressRing {}

#[allow(clippy::declare_interior_mutable_const)]
const RING_INIT: AddressRing = AddressRing {
    len: AtomicU64::new(0),
    lock: SpinFlag::new(),
    _pad: [0; 6],
    slots: UnsafeCell::new([0; ADDRESS_RING_CAPACITY]),
};

static RINGS: [AddressRing; MAX_THREADS] = [RING_INIT; MAX_THREADS];

static PROCESS_INSTRUMENTED: AtomicBool = AtomicBool::new(false);
static STACK_START: AtomicUsize = AtomicUsize::new(0);
static STACK_END: AtomicUsize = AtomicUsize::new(0);

/// Whether the instrumentation runtime has announced itself.
pub fn process_instrumented() -> bool {
    PROCESS_INSTRUMENTED.load(Ordering::Relaxed)
}

/// The main thread's stack range as recorded at init.
pub fn stack_range() -> (usize, usize) {
    (
        STACK_START.load(Ordering::Relaxed),
        STACK_END.load(Ordering::Relaxed),
    )
}

fn record_stack_range() {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return;
    };
    for line in maps.lines() {
        if !line.ends_with("[stack]") {
            continue;
        }
        let Some(range) = line.split_whitespace().next() else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        if let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) {
            STACK_START.store(start, Ordering::Relaxed);
            STACK_END.store(end, Ordering::Relaxed);
        }
        return;
    }
}

fn drain_ring(ring: &AddressRing) {
    ring.lock.acquire();
    let len = ring.len.load(Ordering::Acquire) as usize;
    if len != 0 {
        // SAFETY: the lock excludes concurrent drains and len entries were
        // written before len was published.
        let addrs = unsafe { &(&*ring.slots.get())[..len] };
        registry::dispatch_batch(addrs);
        ring.len.store(0, Ordering::Release);
    }
    ring.lock.release();
}

/// Drain every thread's ring into the dirty trackers. Called by the
/// checkpoint leader once all mutator threads have reached the rendezvous.
pub fn drain_all_rings() {
    for ring in RINGS.iter() {
        drain_ring(ring);
    }
}

/// Install the instrumentation runtime: registers the calling thread's
/// slot, records the stack range and marks the process instrumented.
#[no_mangle]
pub extern "C" fn __crashpoint_rt_init() {
    register_current_thread();
    record_stack_range();
    for ring in RINGS.iter() {
        ring.len.store(0, Ordering::Relaxed);
    }
    PROCESS_INSTRUMENTED.store(true, Ordering::Relaxed);
}

/// Tear-down hook: flushes any addresses still buffered.
#[no_mangle]
pub extern "C" fn __crashpoint_rt_fini() {
    drain_all_rings();
}

/// Per-store hook. Appends to the calling thread's ring, draining it
/// through the registry when full.
#[no_mangle]
pub extern "C" fn __crashpoint_rt_store(addr: *mut c_void) {
    let ring = &RINGS[current_thread_slot()];
    let len = ring.len.load(Ordering::Relaxed) as usize;
    // SAFETY: this thread owns the ring and len < capacity by construction.
    unsafe {
        (*ring.slots.get())[len] = addr as u64;
    }
    let len = len + 1;
    ring.len.store(len as u64, Ordering::Relaxed);
    if len == ADDRESS_RING_CAPACITY {
        drain_ring(ring);
    }
}

/// Range-store hook. Small ranges inside one block take the single-store
/// path; larger ones go straight to the engine.
#[no_mangle]
pub extern "C" fn __crashpoint_rt_range_store(addr: *mut c_void, len: usize) {
    if (addr as usize & BLOCK_MASK) + len <= BLOCK_SIZE {
        __crashpoint_rt_store(addr);
    } else {
        registry::dispatch_range(addr as usize, len);
    }
}

/// Tell the runtime that the bytes `[addr, addr + len)` are about to change.
/// The entry point used by uninstrumented callers (tests, the MPI safe-copy
/// helper, the allocator metadata updates).
pub fn annotate_checkpoint_region(addr: *mut u8, len: usize) {
    registry::dispatch_range(addr as usize, len);
}
