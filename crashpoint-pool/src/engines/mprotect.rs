// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! mprotect-based engine.
//!
//! The heap is the main copy of a mirror image, mapped read-only between
//! checkpoints. The first store into a 4 KiB region faults; the SIGSEGV
//! trampoline marks the region dirty, remaps it read-write and returns. A
//! checkpoint flushes the dirty regions, names the main side consistent,
//! re-protects the heap, copies the dirty regions into the back half and
//! names the back side consistent again.
//!
//! The handler is installed once per process and routes faults through a
//! fixed lock-free table of registered heap ranges, and touches no blocking
//! primitive: a table scan, an atomic bitmap update, a buffer append
//! through the thread's cached slot id (a plain TLS load) and one mprotect
//! call. A thread that faults before it ever touched the runtime has no
//! slot yet; its regions then land in the bitmap only and the tracker
//! turns lossy, degrading the next checkpoint to the global-writeback walk
//! instead of registering a slot inside the handler.

use std::path::Path;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, info};

use crashpoint_core::metadata::{ConsistentSide, MirrorImage, MIRROR_ATTR_HAS_SNAPSHOT};
use crashpoint_core::persist::{flush_range, nt_copy, store_fence};
use crashpoint_core::sync::Barrier;
use crashpoint_core::threads::register_current_thread;
use crashpoint_core::tracker::DirtyTracker;
use crashpoint_core::mapping::FileMapping;
use crashpoint_core::{
    Error, MAX_FLUSH_REGIONS, MAX_THREADS, MIN_POOL_SIZE, REGION_MASK, REGION_SHIFT, REGION_SIZE,
};

use crate::engine::{Coordinator, Engine};
use crate::engines::fixed_base;
use crate::global_flush::GlobalFlush;
use crate::{registry, PoolError, PoolOptions};

const MAX_PROTECTED_RANGES: usize = 16;

struct ProtectedRange {
    start: AtomicUsize,
    end: AtomicUsize,
    engine: AtomicPtr<MprotectEngine>,
}

#[allow(clippy::declare_interior_mutable_const)]
const RANGE_INIT: ProtectedRange = ProtectedRange {
    start: AtomicUsize::new(0),
    end: AtomicUsize::new(0),
    engine: AtomicPtr::new(std::ptr::null_mut()),
};

static PROTECTED_RANGES: [ProtectedRange; MAX_PROTECTED_RANGES] =
    [RANGE_INIT; MAX_PROTECTED_RANGES];
static INSTALL_HANDLER: Once = Once::new();

extern "C" fn fault_trampoline(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    // SAFETY: the kernel hands a valid siginfo to an SA_SIGINFO handler.
    let addr = unsafe { (*info).si_addr() } as usize;
    for range in PROTECTED_RANGES.iter() {
        let start = range.start.load(Ordering::Acquire);
        let end = range.end.load(Ordering::Acquire);
        if start != 0 && addr >= start && addr < end {
            let engine = range.engine.load(Ordering::Acquire);
            if !engine.is_null() {
                // SAFETY: the engine stays registered for its lifetime.
                unsafe { (*engine).handle_fault(addr) };
                return;
            }
        }
    }
    // Not our fault: restore the default disposition; the faulting
    // instruction re-raises and the process dies with a genuine SIGSEGV.
    // A SIGBUS from the mapping is a media error and stays fatal too.
    // SAFETY: resetting a signal disposition is async-signal-safe.
    unsafe { libc::signal(sig, libc::SIG_DFL) };
}

fn install_handler() {
    INSTALL_HANDLER.call_once(|| {
        let action = SigAction::new(
            SigHandler::SigAction(fault_trampoline),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        // SAFETY: the trampoline only performs signal-safe work.
        unsafe {
            sigaction(Signal::SIGSEGV, &action).expect("install SIGSEGV trampoline");
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FlushMode {
    NoAction = 0,
    FlushRegions = 1,
    GlobalWriteback = 2,
}

impl FlushMode {
    fn from_u8(value: u8) -> FlushMode {
        match value {
            1 => FlushMode::FlushRegions,
            2 => FlushMode::GlobalWriteback,
            _ => FlushMode::NoAction,
        }
    }
}

pub struct MprotectEngine {
    _mapping: FileMapping,
    image: MirrorImage,
    nr_regions: u64,
    capacity: usize,
    tracker: DirtyTracker,
    next_thread_id: AtomicU64,
    barrier: Barrier,
    latch: Barrier,
    flush_mode: AtomicU8,
    has_snapshot: std::sync::atomic::AtomicBool,
    checkpoint_traffic: AtomicU64,
    slot: usize,
    verbose: bool,
}

// SAFETY: shared mutation is confined to atomics and the mapped arenas
// under the protocol.
unsafe impl Send for MprotectEngine {}
unsafe impl Sync for MprotectEngine {}

impl MprotectEngine {
    pub fn open(
        path: &Path,
        options: &PoolOptions,
        comm: Option<&dyn Coordinator>,
    ) -> Result<Arc<dyn Engine>, PoolError> {
        let create = options.create && (options.truncate || !FileMapping::exists(path));

        let (mapping, image, capacity) = if create {
            let mut capacity = options.capacity.max(MIN_POOL_SIZE);
            if capacity & REGION_MASK != 0 {
                capacity = (capacity & !REGION_MASK) + REGION_SIZE;
            }
            let mapping =
                FileMapping::create(path, MirrorImage::layout_size(capacity), fixed_base(options))?;
            let image = MirrorImage::create(mapping.base(), capacity)?;
            info!(path = %path.display(), capacity, "created mirror image");
            (mapping, image, capacity)
        } else {
            let mapping = FileMapping::open(path, fixed_base(options))?;
            let image = MirrorImage::open(mapping.base())?;
            let capacity = image.capacity();
            if capacity & REGION_MASK != 0 {
                return Err(PoolError::Core(Error::CapacityInvalid));
            }
            (mapping, image, capacity)
        };

        let nr_regions = (capacity >> REGION_SHIFT) as u64;
        let engine = MprotectEngine {
            _mapping: mapping,
            image,
            nr_regions,
            capacity,
            tracker: DirtyTracker::new(
                nr_regions,
                nr_regions,
                REGION_SHIFT,
                REGION_SHIFT,
                MAX_FLUSH_REGIONS,
            ),
            next_thread_id: AtomicU64::new(0),
            barrier: Barrier::new(),
            latch: Barrier::new(),
            flush_mode: AtomicU8::new(FlushMode::NoAction as u8),
            has_snapshot: std::sync::atomic::AtomicBool::new(false),
            checkpoint_traffic: AtomicU64::new(0),
            slot: 0,
            verbose: options.verbose,
        };

        // The fault trampoline appends to these buffers; they must never be
        // allocated from signal context. The opening thread claims its slot
        // now for the same reason.
        engine.tracker.preallocate_buffers();
        register_current_thread();

        if !create {
            if let Some(comm) = comm {
                // All ranks recover from the same side.
                comm.barrier();
            }
            engine.image.recover_data();
            engine.has_snapshot.store(
                engine.image.attributes() & MIRROR_ATTR_HAS_SNAPSHOT != 0,
                Ordering::Relaxed,
            );
            info!("recovered mirror image");
        }

        let mut engine = engine;
        install_handler();
        let slot = Self::register_range(&mut engine)?;
        engine.slot = slot;

        let engine: Arc<MprotectEngine> = Arc::new(engine);
        // Publish the stable heap ptr for the trampoline, then arm the trap.
        PROTECTED_RANGES[slot].engine.store(
            Arc::as_ptr(&engine) as *mut MprotectEngine,
            Ordering::Release,
        );
        let as_dyn: Arc<dyn Engine> = engine.clone();
        registry::register(&as_dyn);
        engine.protect_regions(0, engine.nr_regions, false);
        debug!(nr_regions, "armed write protection");
        Ok(as_dyn)
    }

    fn register_range(engine: &mut MprotectEngine) -> Result<usize, PoolError> {
        let start = engine.image.main_data() as usize;
        let end = start + engine.capacity;
        for (slot, range) in PROTECTED_RANGES.iter().enumerate() {
            if range
                .start
                .compare_exchange(0, start, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                range.end.store(end, Ordering::Release);
                return Ok(slot);
            }
        }
        Err(PoolError::UnsupportedEngine)
    }

    fn protect_regions(&self, region_id: u64, count: u64, writable: bool) {
        let mut prot = libc::PROT_READ;
        if writable {
            prot |= libc::PROT_WRITE;
        }
        // SAFETY: the range lies inside the mapped main arena.
        let ret = unsafe {
            libc::mprotect(
                self.image
                    .main_data()
                    .wrapping_add(region_id as usize * REGION_SIZE)
                    .cast(),
                count as usize * REGION_SIZE,
                prot,
            )
        };
        if ret != 0 {
            // Losing write protection loses dirty tracking; do not limp on.
            std::process::abort();
        }
    }

    /// Trampoline target: record the dirty region and open it for writing.
    /// Signal context: only the non-registering tracker entry point.
    fn handle_fault(&self, addr: usize) {
        let region_id = ((addr - self.image.main_data() as usize) >> REGION_SHIFT) as u64;
        self.tracker.record_nonblocking(0, region_id);
        self.protect_regions(region_id, 1, true);
    }

    fn current_flush_mode(&self) -> FlushMode {
        FlushMode::from_u8(self.flush_mode.load(Ordering::Acquire))
    }

    fn region_ptr(&self, region_id: u64) -> *mut u8 {
        // SAFETY: bounded by the arena size.
        unsafe { self.image.main_data().add(region_id as usize * REGION_SIZE) }
    }

    fn flush_parallel(&self, tid: usize, nr_threads: u64, mode: FlushMode) {
        match mode {
            FlushMode::NoAction => {}
            FlushMode::FlushRegions => {
                let mut slot = tid;
                while slot < MAX_THREADS {
                    for &region_id in self.tracker.buffer(slot) {
                        // SAFETY: one region of the mapped main arena.
                        unsafe { flush_range(self.region_ptr(region_id), REGION_SIZE) };
                    }
                    slot += nr_threads as usize;
                }
            }
            FlushMode::GlobalWriteback => {
                if tid == 0 && !GlobalFlush::get().flush() {
                    let dirty = self.tracker.block_dirty(0);
                    for region_id in 0..self.nr_regions {
                        if dirty.test(region_id, Ordering::Relaxed) {
                            // SAFETY: one region of the mapped main arena.
                            unsafe { flush_range(self.region_ptr(region_id), REGION_SIZE) };
                        }
                    }
                }
            }
        }
        store_fence();
    }

    fn write_back_parallel(&self, tid: usize, nr_threads: u64, mode: FlushMode) {
        let delta = self.capacity;
        let copy_region = |region_id: u64| -> u64 {
            let src = self.region_ptr(region_id);
            // SAFETY: main and back halves are `capacity` bytes apart.
            unsafe { nt_copy(src.add(delta), src, REGION_SIZE) };
            REGION_SIZE as u64
        };
        let mut traffic = 0;
        match mode {
            FlushMode::NoAction => {}
            FlushMode::FlushRegions => {
                let mut slot = tid;
                while slot < MAX_THREADS {
                    for &region_id in self.tracker.buffer(slot) {
                        traffic += copy_region(region_id);
                    }
                    slot += nr_threads as usize;
                }
            }
            FlushMode::GlobalWriteback => {
                let dirty = self.tracker.block_dirty(0);
                let mut region_id = tid as u64;
                while region_id < self.nr_regions {
                    if dirty.test(region_id, Ordering::Relaxed) {
                        traffic += copy_region(region_id);
                    }
                    region_id += nr_threads;
                }
            }
        }
        store_fence();
        self.checkpoint_traffic.fetch_add(traffic, Ordering::Relaxed);
    }

    fn checkpoint_inner(&self, nr_threads: u64, comm: Option<&dyn Coordinator>) {
        let tid = self.next_thread_id.fetch_add(1, Ordering::Relaxed) as usize;
        let is_leader = tid == 0;

        self.barrier.wait(nr_threads as u32, tid);
        if is_leader {
            let fill = self.tracker.fill_state();
            let mode = if fill.all_empty && comm.is_none() {
                FlushMode::NoAction
            } else if fill.has_full {
                FlushMode::GlobalWriteback
            } else {
                FlushMode::FlushRegions
            };
            self.flush_mode.store(mode as u8, Ordering::Release);
            if mode == FlushMode::NoAction {
                self.next_thread_id.store(0, Ordering::Relaxed);
            }
            debug!(?mode, "mprotect checkpoint mode");
            self.latch.latch_add(tid);
        }
        self.latch.latch_wait(tid);

        let mode = self.current_flush_mode();
        if mode == FlushMode::NoAction {
            return;
        }

        // Phase (a): persist the working pages, then name main consistent.
        self.flush_parallel(tid, nr_threads, mode);
        self.barrier.wait(nr_threads as u32, tid);

        if is_leader {
            if let Some(comm) = comm {
                comm.barrier();
            }
            self.image.set_consistent_side(ConsistentSide::Main);
            if let Some(comm) = comm {
                comm.barrier();
            }
            // Re-arm the traps before any post-checkpoint store sneaks in.
            self.protect_regions(0, self.nr_regions, false);
            self.latch.latch_add(tid);
        }
        self.latch.latch_wait(tid);

        // Phase (b): propagate main to back, then name back consistent.
        self.write_back_parallel(tid, nr_threads, mode);
        self.barrier.wait(nr_threads as u32, tid);

        if is_leader {
            match mode {
                FlushMode::GlobalWriteback => self.tracker.clear_epoch(0),
                _ => self.tracker.clear_buffered_bits(0),
            }
            self.tracker.reset_buffers();
            if let Some(comm) = comm {
                comm.barrier();
            }
            self.image.set_consistent_side(ConsistentSide::Back);
            if let Some(comm) = comm {
                comm.barrier();
            }
            if !self.has_snapshot.load(Ordering::Relaxed) {
                self.image.set_attributes(MIRROR_ATTR_HAS_SNAPSHOT);
                self.has_snapshot.store(true, Ordering::Relaxed);
            }
            self.next_thread_id.store(0, Ordering::Relaxed);
            self.latch.latch_add(tid);
        }
        self.latch.latch_wait(tid);
    }
}

impl Engine for MprotectEngine {
    fn checkpoint(&self, nr_threads: u64) {
        self.checkpoint_inner(nr_threads, None);
    }

    fn checkpoint_coordinated(&self, nr_threads: u64, comm: &dyn Coordinator) {
        self.checkpoint_inner(nr_threads, Some(comm));
    }

    fn exist_snapshot(&self) -> bool {
        self.image.attributes() & MIRROR_ATTR_HAS_SNAPSHOT != 0
    }

    fn base_address(&self) -> *mut u8 {
        self.image.main_data()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    // Dirty tracking is fault-driven; the explicit hooks only widen the
    // write window for annotated ranges.
    fn on_range_store(&self, addr: usize, len: usize) {
        if len == 0 {
            return;
        }
        let offset = addr - self.image.main_data() as usize;
        let len = len.min(self.capacity - offset);
        self.tracker.record_range(0, offset, len);
        let first = (offset >> REGION_SHIFT) as u64;
        let last = ((offset + len - 1) >> REGION_SHIFT) as u64;
        self.protect_regions(first, last - first + 1, true);
    }

    fn on_store(&self, addr: usize) {
        self.on_range_store(addr, 1);
    }

    fn has_pending_dirty(&self) -> bool {
        self.tracker.block_dirty(0).any()
    }
}

impl Drop for MprotectEngine {
    fn drop(&mut self) {
        registry::unregister(self.address_range());
        let range = &PROTECTED_RANGES[self.slot];
        range.engine.store(std::ptr::null_mut(), Ordering::Release);
        range.end.store(0, Ordering::Release);
        range.start.store(0, Ordering::Release);
        // Leave the pages writable; the mapping goes away with _mapping.
        self.protect_regions(0, self.nr_regions, true);
        if self.verbose {
            info!(
                traffic_bytes = self.checkpoint_traffic.load(Ordering::Relaxed),
                nr_regions = self.nr_regions,
                "closing mprotect engine"
            );
        }
    }
}
