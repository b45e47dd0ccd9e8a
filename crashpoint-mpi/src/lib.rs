// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Multi-process extension.
//!
//! Wires a pool to an inter-process communicator so that every rank
//! advances its commit point together, and layers a protected-buffer API on
//! top: `protect` binds a rank-private volatile buffer to a root slot, and
//! the coordinated checkpoint diffs each protected buffer against its
//! persistent shadow block by block before running the engine protocol with
//! barriers around the epoch flip.
//!
//! The actual transport is abstracted behind [`Coordinator`] (re-exported
//! from the pool crate); an MPI binding implements it with `MPI_Barrier`
//! and `MPI_Allreduce`, and [`SingleProcess`] serves tests and single-rank
//! runs.

use std::path::Path;
use std::sync::Mutex;

use tracing::debug;

use crashpoint_core::persist::store_fence;
use crashpoint_core::BLOCK_SIZE;
use crashpoint_pool::{annotate_checkpoint_region, Pool, PoolError, PoolOptions};

pub use crashpoint_pool::engine::Coordinator;

/// Trivial communicator for a world of one rank.
pub struct SingleProcess;

impl Coordinator for SingleProcess {
    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn allreduce_min_u64(&self, value: u64) -> u64 {
        value
    }

    fn allreduce_sum_u64(&self, value: u64) -> u64 {
        value
    }
}

struct Protected {
    index: usize,
    runtime: *mut u8,
    shadow: *mut u8,
    len: usize,
}

// SAFETY: the raw pointers reference caller-owned and pool-owned buffers
// whose lifetimes outlive the pool by contract.
unsafe impl Send for Protected {}

/// A pool plus the protected-buffer descriptors of this rank.
pub struct ProtectedPool {
    pool: Pool,
    regions: Mutex<Vec<Protected>>,
}

impl ProtectedPool {
    /// Coordinated open: every rank must agree on creation, and after a
    /// crash all ranks are rolled back to the minimum committed epoch
    /// before recovery.
    pub fn open(
        path: &Path,
        options: &PoolOptions,
        comm: &dyn Coordinator,
    ) -> Result<ProtectedPool, PoolError> {
        let pool = Pool::open_coordinated(path, options, comm)?;
        Ok(ProtectedPool {
            pool,
            regions: Mutex::new(Vec::new()),
        })
    }

    /// Bind the volatile buffer `[ptr, ptr + len)` to root slot `index`.
    ///
    /// On the first call against a fresh heap the persistent shadow is
    /// allocated and rooted; on later opens the persisted bytes are copied
    /// back into the caller's buffer.
    ///
    /// # Safety
    /// `ptr` must stay valid for the life of the pool and `len` bytes long.
    pub unsafe fn protect(
        &self,
        index: usize,
        ptr: *mut u8,
        len: usize,
    ) -> Result<(), PoolError> {
        let shadow = self.pool.get_root(index);
        let shadow = if shadow.is_null() {
            let fresh = self
                .pool
                .alloc(len)
                .ok_or(PoolError::AllocOptions)?
                .as_ptr();
            self.pool.set_root(index, fresh)?;
            debug!(index, len, "allocated persistent shadow");
            fresh
        } else {
            // Returning rank: replay the persisted bytes.
            std::ptr::copy_nonoverlapping(shadow, ptr, len);
            debug!(index, len, "restored protected buffer");
            shadow
        };
        self.regions.lock().expect("protect table").push(Protected {
            index,
            runtime: ptr,
            shadow,
            len,
        });
        Ok(())
    }

    /// Diff every protected buffer into its shadow, then run the
    /// coordinated checkpoint protocol.
    pub fn checkpoint(&self, nr_threads: u64, comm: &dyn Coordinator) {
        {
            let regions = self.regions.lock().expect("protect table");
            for region in regions.iter() {
                // SAFETY: both buffers are `len` bytes per the protect
                // contract.
                unsafe { safe_copy(region.shadow, region.runtime, region.len) };
            }
        }
        store_fence();
        self.pool.checkpoint_coordinated(nr_threads, comm);
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Root slots currently protected by this rank.
    pub fn protected_roots(&self) -> Vec<usize> {
        self.regions
            .lock()
            .expect("protect table")
            .iter()
            .map(|region| region.index)
            .collect()
    }
}

/// Copy `len` bytes from `src` to `dst`, block by block, announcing and
/// writing only the blocks that actually changed so the dirty tracker sees
/// the minimal set.
///
/// # Safety
/// Both pointers must be valid for `len` bytes; `dst` must lie inside the
/// pool heap.
unsafe fn safe_copy(dst: *mut u8, src: *const u8, len: usize) {
    let mut offset = 0;
    while offset < len {
        let chunk = BLOCK_SIZE.min(len - offset);
        let dst_chunk = std::slice::from_raw_parts_mut(dst.add(offset), chunk);
        let src_chunk = std::slice::from_raw_parts(src.add(offset), chunk);
        if dst_chunk != src_chunk {
            annotate_checkpoint_region(dst.add(offset), chunk);
            dst_chunk.copy_from_slice(src_chunk);
        }
        offset += chunk;
    }
}

#[cfg(test)]
mod t_mpi {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn options(base: usize) -> PoolOptions {
        PoolOptions {
            create: true,
            capacity: 64 << 20,
            shadow_capacity_factor: 0.25,
            fixed_base_address: base,
            ..PoolOptions::default()
        }
    }

    #[test]
    #[serial]
    fn protect_restores_after_simulated_crash() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("mpi-image");
        let comm = SingleProcess;
        let base = 0x0210_0000_0000usize;

        let mut buf = vec![0u8; 65536];
        {
            let pool = ProtectedPool::open(&path, &options(base), &comm).expect("open");
            // SAFETY: buf outlives the pool scope.
            unsafe { pool.protect(0, buf.as_mut_ptr(), buf.len()).expect("protect") };
            buf[1000] = 0x77;
            buf[60000] = 0x99;
            pool.checkpoint(1, &comm);
            assert_eq!(pool.protected_roots(), vec![0]);
            // Simulated crash: mutate after the checkpoint and drop without
            // another commit.
            buf[1000] = 0x11;
        }

        let mut replay = vec![0u8; 65536];
        let pool = ProtectedPool::open(&path, &options(base), &comm).expect("reopen");
        // SAFETY: replay outlives the pool scope.
        unsafe {
            pool.protect(0, replay.as_mut_ptr(), replay.len())
                .expect("protect")
        };
        assert_eq!(replay[1000], 0x77);
        assert_eq!(replay[60000], 0x99);
        assert!(replay.iter().enumerate().all(|(i, &b)| match i {
            1000 => b == 0x77,
            60000 => b == 0x99,
            _ => b == 0,
        }));
    }

    #[test]
    #[serial]
    fn epoch_aligned_commits_with_single_rank() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("mpi-epochs");
        let comm = SingleProcess;
        let base = 0x0218_0000_0000usize;

        let mut buf = vec![0u8; 4096];
        let pool = ProtectedPool::open(&path, &options(base), &comm).expect("open");
        // SAFETY: buf outlives the pool.
        unsafe { pool.protect(3, buf.as_mut_ptr(), buf.len()).expect("protect") };
        let before = pool.pool().engine().committed_epoch();
        buf[0] = 1;
        pool.checkpoint(1, &comm);
        buf[0] = 2;
        pool.checkpoint(1, &comm);
        assert_eq!(pool.pool().engine().committed_epoch(), before + 2);
    }
}
