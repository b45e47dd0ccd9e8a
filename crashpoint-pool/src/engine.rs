// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Engine abstraction and variant selection.

use std::path::Path;
use std::sync::Arc;

use crashpoint_core::image::SegmentState;

use crate::engines::{
    dirtybit::DirtyBitEngine, instrumented::InstrumentedEngine, mprotect::MprotectEngine,
    noop::NoopEngine, nvm::NvmEngine,
};
use crate::{PoolError, PoolOptions};

/// Inter-process coordination required by the coordinated checkpoint: a
/// barrier around the commit point plus the two reductions used at open.
/// The single-process implementation lives in `crashpoint-mpi`.
pub trait Coordinator: Sync {
    fn size(&self) -> usize;
    fn barrier(&self);
    fn allreduce_min_u64(&self, value: u64) -> u64;
    fn allreduce_sum_u64(&self, value: u64) -> u64;
}

/// A checkpoint engine: the dirty-tracking mechanism plus the protocol that
/// turns a set of dirty blocks into a durable atomic snapshot.
pub trait Engine: Send + Sync {
    /// Run the checkpoint protocol with `nr_threads` participating caller
    /// threads. Returns when the new state is durable.
    fn checkpoint(&self, nr_threads: u64);

    /// Coordinated variant: barriers are taken around the commit point so
    /// that all processes advance together. Engines without a coordinated
    /// path fall back to the local protocol.
    fn checkpoint_coordinated(&self, nr_threads: u64, _comm: &dyn Coordinator) {
        self.checkpoint(nr_threads);
    }

    /// Whether the image holds at least one committed checkpoint.
    fn exist_snapshot(&self) -> bool;

    /// Base address of the working heap.
    fn base_address(&self) -> *mut u8;

    /// Capacity of the working heap in bytes.
    fn capacity(&self) -> usize;

    /// Block until any background write-back has drained.
    fn wait_for_background_task(&self) {}

    /// Dirty-tracking hook for a single store at `addr`.
    fn on_store(&self, _addr: usize) {}

    /// Dirty-tracking hook for a range store.
    fn on_range_store(&self, _addr: usize, _len: usize) {}

    /// The half-open address range of the working heap.
    fn address_range(&self) -> (usize, usize) {
        let base = self.base_address() as usize;
        (base, base + self.capacity())
    }

    /// Commit counter of the image, when the engine has one.
    fn committed_epoch(&self) -> u64 {
        0
    }

    /// Authoritative state of a main segment, when the engine tracks one.
    fn segment_state(&self, _segment_id: u64) -> Option<SegmentState> {
        None
    }

    /// Whether any dirty bits still await mirroring. Diagnostic surface used
    /// by tests asserting dirty-bit closure.
    fn has_pending_dirty(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Noop,
    Nvm,
    Mprotect,
    DirtyBit,
    Instrumented,
}

impl EngineKind {
    pub fn parse(name: &str) -> Result<EngineKind, PoolError> {
        match name {
            "noop" => Ok(EngineKind::Noop),
            "nvm" => Ok(EngineKind::Nvm),
            "mprotect" => Ok(EngineKind::Mprotect),
            "dirty-bit" => Ok(EngineKind::DirtyBit),
            "default" => Ok(EngineKind::Instrumented),
            _ => Err(PoolError::UnsupportedEngine),
        }
    }
}

/// Open the engine selected by `options.engine_name`.
pub fn open_engine(
    path: &Path,
    options: &PoolOptions,
    comm: Option<&dyn Coordinator>,
) -> Result<Arc<dyn Engine>, PoolError> {
    match EngineKind::parse(&options.engine_name)? {
        EngineKind::Noop => Ok(NoopEngine::open(options)?),
        EngineKind::Nvm => Ok(NvmEngine::open(path, options)?),
        EngineKind::Mprotect => Ok(MprotectEngine::open(path, options, comm)?),
        EngineKind::DirtyBit => Ok(DirtyBitEngine::open(path, options, comm)?),
        EngineKind::Instrumented => Ok(InstrumentedEngine::open(path, options, comm)?),
    }
}
