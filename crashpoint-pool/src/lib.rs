// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Crashpoint pool
//!
//! The user-facing surface of the crashpoint runtime: open a pool over an
//! image file, allocate from its heap, pin entry points in the root table,
//! and declare checkpoints that become the recovery point after any crash.
//!
//! ```no_run
//! use crashpoint_pool::{Pool, PoolOptions};
//!
//! let options = PoolOptions {
//!     create: true,
//!     capacity: 64 << 20,
//!     ..PoolOptions::default()
//! };
//! let pool = Pool::open(std::path::Path::new("/mnt/pmem/app.img"), &options).unwrap();
//! let data = pool.alloc(4096).unwrap();
//! pool.set_root(0, data.as_ptr()).unwrap();
//! // ... mutate ...
//! pool.checkpoint(1);
//! ```

pub mod alloc;
pub mod background;
pub mod engine;
pub mod engines;
pub mod global_flush;
pub mod hook;
pub mod registry;

use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, RwLock};

use errno::Errno;
use lazy_static::lazy_static;
use tracing::info;

use crashpoint_core::persist::store_fence;
use crashpoint_core::{Error, DEFAULT_FIXED_BASE_ADDRESS, SHADOW_CAPACITY_FACTOR};

use crate::alloc::HeapAllocator;
use crate::engine::{Coordinator, Engine};

pub use crate::hook::annotate_checkpoint_region;
pub use crashpoint_core::image::SegmentState;

/// Error condition returned by the pool APIs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A core-layer failure (mapping, image format, syscall).
    Core(Error),

    /// The requested engine name is unknown or its table is full.
    UnsupportedEngine,

    /// The allocator options are unusable for this heap.
    AllocOptions,

    /// A kernel interface the engine depends on failed.
    Kernel(&'static str, Errno),

    /// A coordinated open found a rank lagging the minimum commit epoch by
    /// two or more: the images no longer share a common recovery point.
    EpochSkew,

    /// Ranks of a coordinated open disagree about creating the image.
    CreateMismatch,

    /// Root index outside the root table.
    RootIndex,
}

impl From<Error> for PoolError {
    fn from(err: Error) -> PoolError {
        PoolError::Core(err)
    }
}

pub(crate) fn syserror_pool(origin: &'static str) -> PoolError {
    PoolError::Kernel(origin, errno::errno())
}

/// Options for [`Pool::open`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Create the image when it does not exist.
    pub create: bool,
    /// Discard any existing image first.
    pub truncate: bool,
    /// Log traffic statistics at close.
    pub verbose: bool,
    /// Working-heap capacity for a fresh image; rounded up to the engine
    /// granularity, with a floor of the minimum container size.
    pub capacity: usize,
    /// Ratio of back segments to main segments for a fresh image.
    pub shadow_capacity_factor: f64,
    /// Virtual base the working heap is mapped at; must be identical across
    /// runs of the same image. Zero lets the kernel choose (the heap is
    /// then only position independent through pptrs).
    pub fixed_base_address: usize,
    /// Allocator variant. Only "default" is built in.
    pub allocator_name: String,
    /// Engine variant: one of "noop", "nvm", "mprotect", "dirty-bit",
    /// "default".
    pub engine_name: String,
}

impl Default for PoolOptions {
    fn default() -> PoolOptions {
        PoolOptions {
            create: false,
            truncate: false,
            verbose: false,
            capacity: 0,
            shadow_capacity_factor: SHADOW_CAPACITY_FACTOR,
            fixed_base_address: DEFAULT_FIXED_BASE_ADDRESS,
            allocator_name: "default".into(),
            engine_name: "default".into(),
        }
    }
}

struct PoolInner {
    engine: Arc<dyn Engine>,
    allocator: HeapAllocator,
}

/// A persistent memory pool: an engine plus the allocator over its heap.
///
/// `Pool` is cheaply cloneable; dropping the last clone closes the pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

lazy_static! {
    /// Process-global pool used by the no-argument allocation shims.
    static ref DEFAULT_POOL: RwLock<Option<Pool>> = RwLock::new(None);
}

impl Pool {
    /// Open or create a pool at `path`.
    pub fn open(path: &Path, options: &PoolOptions) -> Result<Pool, PoolError> {
        Self::open_inner(path, options, None)
    }

    /// Open or create a pool whose commit points are coordinated across the
    /// processes of `comm`. Ahead-of-minimum ranks are rolled back before
    /// recovery; a skew of two or more epochs is unrecoverable.
    pub fn open_coordinated(
        path: &Path,
        options: &PoolOptions,
        comm: &dyn Coordinator,
    ) -> Result<Pool, PoolError> {
        Self::open_inner(path, options, Some(comm))
    }

    fn open_inner(
        path: &Path,
        options: &PoolOptions,
        comm: Option<&dyn Coordinator>,
    ) -> Result<Pool, PoolError> {
        if options.allocator_name != "default" {
            return Err(PoolError::AllocOptions);
        }
        let engine = engine::open_engine(path, options, comm)?;
        let fresh = !engine.exist_snapshot();
        let allocator = HeapAllocator::open(&engine, fresh)?;
        info!(path = %path.display(), engine = %options.engine_name, fresh, "pool open");
        Ok(Pool {
            inner: Arc::new(PoolInner { engine, allocator }),
        })
    }

    /// Allocate `size` bytes from the persistent heap. Null on exhaustion.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.allocator.alloc(size)
    }

    /// Return an allocation to the heap.
    pub fn free(&self, ptr: *mut u8) {
        self.inner.allocator.free(ptr);
    }

    /// Bind root slot `index` (0..1024) to `target`.
    pub fn set_root(&self, index: usize, target: *const u8) -> Result<(), PoolError> {
        self.inner.allocator.set_root(index, target)
    }

    /// The pointer bound to root slot `index`, or null.
    pub fn get_root(&self, index: usize) -> *mut u8 {
        self.inner.allocator.get_root(index)
    }

    /// Declare a checkpoint. All `nr_threads` mutator threads must call
    /// this; when it returns the new state is durable.
    pub fn checkpoint(&self, nr_threads: u64) {
        store_fence();
        self.inner.engine.checkpoint(nr_threads);
        store_fence();
    }

    /// Coordinated variant of [`Pool::checkpoint`].
    pub fn checkpoint_coordinated(&self, nr_threads: u64, comm: &dyn Coordinator) {
        store_fence();
        self.inner.engine.checkpoint_coordinated(nr_threads, comm);
        store_fence();
    }

    /// Block until any background write-back has drained.
    pub fn wait_for_background_task(&self) {
        self.inner.engine.wait_for_background_task();
    }

    /// Install this pool as the process-global default used by
    /// [`default_alloc`] and [`default_free`].
    pub fn set_default(&self) {
        let mut default = DEFAULT_POOL.write().expect("default pool");
        if default.is_some() {
            tracing::warn!("default pool already assigned, reassigning");
        }
        *default = Some(self.clone());
    }

    /// Base address of the working heap.
    pub fn base_address(&self) -> *mut u8 {
        self.inner.engine.base_address()
    }

    /// Capacity of the working heap.
    pub fn capacity(&self) -> usize {
        self.inner.engine.capacity()
    }

    /// The engine, for introspection.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }
}

/// Allocate from the process-global default pool.
pub fn default_alloc(size: usize) -> Option<NonNull<u8>> {
    let default = DEFAULT_POOL.read().expect("default pool");
    default.as_ref()?.alloc(size)
}

/// Free into the process-global default pool.
pub fn default_free(ptr: *mut u8) {
    let default = DEFAULT_POOL.read().expect("default pool");
    if let Some(pool) = default.as_ref() {
        pool.free(ptr);
    }
}

/// Drop the process-global default pool reference.
pub fn clear_default_pool() {
    *DEFAULT_POOL.write().expect("default pool") = None;
}

#[cfg(test)]
mod t_pool {
    use super::*;
    use serial_test::serial;

    fn noop_options() -> PoolOptions {
        PoolOptions {
            create: true,
            capacity: 1 << 20,
            engine_name: "noop".into(),
            fixed_base_address: 0,
            ..PoolOptions::default()
        }
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let options = PoolOptions {
            engine_name: "undolog".into(),
            ..noop_options()
        };
        assert_eq!(
            Pool::open(Path::new("/tmp/unused"), &options).err(),
            Some(PoolError::UnsupportedEngine)
        );
    }

    #[test]
    fn unknown_allocator_is_rejected() {
        let options = PoolOptions {
            allocator_name: "lrmalloc".into(),
            ..noop_options()
        };
        assert_eq!(
            Pool::open(Path::new("/tmp/unused"), &options).err(),
            Some(PoolError::AllocOptions)
        );
    }

    #[test]
    #[serial]
    fn default_pool_shims() {
        let pool = Pool::open(Path::new("/tmp/unused"), &noop_options()).expect("open");
        assert!(default_alloc(64).is_none());
        pool.set_default();
        let ptr = default_alloc(64).expect("default alloc");
        default_free(ptr.as_ptr());
        clear_default_pool();
        assert!(default_alloc(64).is_none());
    }

    #[test]
    fn roots_and_alloc_through_pool() {
        let pool = Pool::open(Path::new("/tmp/unused"), &noop_options()).expect("open");
        let ptr = pool.alloc(128).expect("alloc");
        pool.set_root(7, ptr.as_ptr()).expect("set root");
        assert_eq!(pool.get_root(7), ptr.as_ptr());
        assert!(pool.get_root(8).is_null());
        assert!(pool.set_root(4096, ptr.as_ptr()).is_err());
    }
}
