// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Soft-dirty-bit engine.
//!
//! No per-store hook at all: the mutator works in an anonymous heap at the
//! fixed base and the kernel records which pages it touched. At checkpoint
//! time the leader reads the soft-dirty bits from `/proc/self/pagemap`,
//! every thread replays the dirty pages into the main copy of the mirror
//! image, the main side is named consistent, the pages are propagated to
//! the back copy, the back side is named consistent, and the bits are reset
//! through `/proc/self/clear_refs`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{ByteOrder, NativeEndian};
use tracing::{debug, info};

use crashpoint_core::mapping::{map_anonymous, unmap_anonymous, FileMapping};
use crashpoint_core::metadata::{ConsistentSide, MirrorImage, MIRROR_ATTR_HAS_SNAPSHOT};
use crashpoint_core::persist::{nt_copy, store_fence};
use crashpoint_core::sync::Barrier;
use crashpoint_core::{Error, MIN_POOL_SIZE, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PTE_SOFT_DIRTY_BIT};

use crate::engine::{Coordinator, Engine};
use crate::engines::fixed_base;
use crate::{registry, syserror_pool, PoolError, PoolOptions};

pub struct DirtyBitEngine {
    _mapping: FileMapping,
    image: MirrorImage,
    working: *mut u8,
    capacity: usize,
    nr_pages: u64,
    pagemap: File,
    clear_refs: Mutex<File>,
    pte_buffer: RwLock<Vec<u64>>,
    next_thread_id: AtomicU64,
    barrier: Barrier,
    latch: Barrier,
    has_snapshot: AtomicBool,
    checkpoint_traffic: AtomicU64,
    verbose: bool,
}

// SAFETY: the working heap pointer is shared by design; protocol state is
// behind atomics and mutexes.
unsafe impl Send for DirtyBitEngine {}
unsafe impl Sync for DirtyBitEngine {}

impl DirtyBitEngine {
    pub fn open(
        path: &Path,
        options: &PoolOptions,
        comm: Option<&dyn Coordinator>,
    ) -> Result<Arc<dyn Engine>, PoolError> {
        let create = options.create && (options.truncate || !FileMapping::exists(path));

        let (mapping, image, capacity) = if create {
            let mut capacity = options.capacity.max(MIN_POOL_SIZE);
            if capacity & PAGE_MASK != 0 {
                capacity = (capacity & !PAGE_MASK) + PAGE_SIZE;
            }
            let mapping = FileMapping::create(path, MirrorImage::layout_size(capacity), None)?;
            let image = MirrorImage::create(mapping.base(), capacity)?;
            info!(path = %path.display(), capacity, "created mirror image");
            (mapping, image, capacity)
        } else {
            let mapping = FileMapping::open(path, None)?;
            let image = MirrorImage::open(mapping.base())?;
            let capacity = image.capacity();
            if capacity & PAGE_MASK != 0 {
                return Err(PoolError::Core(Error::CapacityInvalid));
            }
            (mapping, image, capacity)
        };

        let nr_pages = (capacity >> PAGE_SHIFT) as u64;
        let working = map_anonymous(capacity, fixed_base(options))?;

        let pagemap = File::open("/proc/self/pagemap")
            .map_err(|_| syserror_pool("open pagemap"))?;
        let clear_refs = OpenOptions::new()
            .write(true)
            .open("/proc/self/clear_refs")
            .map_err(|_| syserror_pool("open clear_refs"))?;

        let engine = DirtyBitEngine {
            _mapping: mapping,
            image,
            working,
            capacity,
            nr_pages,
            pagemap,
            clear_refs: Mutex::new(clear_refs),
            pte_buffer: RwLock::new(vec![0; nr_pages as usize]),
            next_thread_id: AtomicU64::new(0),
            barrier: Barrier::new(),
            latch: Barrier::new(),
            has_snapshot: AtomicBool::new(false),
            checkpoint_traffic: AtomicU64::new(0),
            verbose: options.verbose,
        };

        if !create {
            if let Some(comm) = comm {
                comm.barrier();
            }
            engine.image.recover_data();
            engine.prepare_working_memory();
            engine.has_snapshot.store(
                engine.image.attributes() & MIRROR_ATTR_HAS_SNAPSHOT != 0,
                Ordering::Relaxed,
            );
            info!("recovered mirror image");
        }

        // Start tracing from a clean slate.
        engine.reset_page_map()?;
        let engine: Arc<dyn Engine> = Arc::new(engine);
        registry::register(&engine);
        Ok(engine)
    }

    fn prepare_working_memory(&self) {
        // SAFETY: both copies are capacity bytes.
        unsafe {
            crashpoint_core::persist::nt_copy_eliding(
                self.working,
                self.image.main_data(),
                self.capacity,
            );
        }
        store_fence();
    }

    /// Fill the PTE buffer with one pagemap word per working-heap page.
    fn read_page_map(&self) -> Result<(), PoolError> {
        let mut ptes = self.pte_buffer.write().expect("pte buffer");
        let offset = (self.working as usize >> PAGE_SHIFT) as u64 * 8;
        let mut raw = vec![0u8; self.nr_pages as usize * 8];
        self.pagemap
            .read_exact_at(&mut raw, offset)
            .map_err(|_| syserror_pool("read pagemap"))?;
        NativeEndian::read_u64_into(&raw, &mut ptes);
        Ok(())
    }

    /// Clear the soft-dirty bits for the whole process.
    fn reset_page_map(&self) -> Result<(), PoolError> {
        let mut clear_refs = self.clear_refs.lock().expect("clear_refs");
        clear_refs
            .write_all(b"4")
            .map_err(|_| syserror_pool("write clear_refs"))?;
        Ok(())
    }

    fn page_ptr(&self, base: *mut u8, page_id: u64) -> *mut u8 {
        // SAFETY: bounded by the heap capacity.
        unsafe { base.add(page_id as usize * PAGE_SIZE) }
    }

    /// Copy every soft-dirty page from `src` into `dst`, striding across
    /// the participants.
    fn copy_dirty_pages(&self, tid: usize, nr_threads: u64, src: *mut u8, dst: *mut u8) {
        let ptes = self.pte_buffer.read().expect("pte buffer");
        let mut traffic = 0;
        let mut page_id = tid as u64;
        while page_id < self.nr_pages {
            if ptes[page_id as usize] & PTE_SOFT_DIRTY_BIT != 0 {
                // SAFETY: one page on both sides.
                unsafe {
                    nt_copy(
                        self.page_ptr(dst, page_id),
                        self.page_ptr(src, page_id),
                        PAGE_SIZE,
                    );
                }
                traffic += PAGE_SIZE as u64;
            }
            page_id += nr_threads;
        }
        drop(ptes);
        store_fence();
        self.checkpoint_traffic.fetch_add(traffic, Ordering::Relaxed);
    }

    fn checkpoint_inner(&self, nr_threads: u64, comm: Option<&dyn Coordinator>) {
        let tid = self.next_thread_id.fetch_add(1, Ordering::Relaxed) as usize;
        let is_leader = tid == 0;

        self.barrier.wait(nr_threads as u32, tid);
        if is_leader {
            self.read_page_map().expect("pagemap read during checkpoint");
            debug!("soft-dirty bits captured");
            self.latch.latch_add(tid);
        }
        self.latch.latch_wait(tid);

        // Phase (a): replay dirty working pages into main, commit MAIN.
        self.copy_dirty_pages(tid, nr_threads, self.working, self.image.main_data());
        self.barrier.wait(nr_threads as u32, tid);
        if is_leader {
            if let Some(comm) = comm {
                comm.barrier();
            }
            self.image.set_consistent_side(ConsistentSide::Main);
            if let Some(comm) = comm {
                comm.barrier();
            }
            self.latch.latch_add(tid);
        }
        self.latch.latch_wait(tid);

        // Phase (b): propagate main to back, commit BACK.
        self.copy_dirty_pages(tid, nr_threads, self.image.main_data(), self.image.back_data());
        self.barrier.wait(nr_threads as u32, tid);
        if is_leader {
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
            self.reset_page_map().expect("clear_refs during checkpoint");
            self.next_thread_id.store(0, Ordering::Relaxed);
            self.latch.latch_add(tid);
        }
        self.latch.latch_wait(tid);
    }
}

impl Engine for DirtyBitEngine {
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
        self.working
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    // The kernel tracks stores; the hooks have nothing to record.
}

impl Drop for DirtyBitEngine {
    fn drop(&mut self) {
        registry::unregister(self.address_range());
        if self.verbose {
            info!(
                traffic_bytes = self.checkpoint_traffic.load(Ordering::Relaxed),
                nr_pages = self.nr_pages,
                "closing dirty-bit engine"
            );
        }
        // SAFETY: working/capacity describe the anonymous mapping from open.
        unsafe { unmap_anonymous(self.working, self.capacity) };
    }
}
