// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! No-op engine: a plain anonymous heap without any durability. Useful as a
//! baseline and for exercising the allocator and hook plumbing in tests.

use std::sync::Arc;

use crashpoint_core::mapping::{map_anonymous, unmap_anonymous};

use crate::engine::Engine;
use crate::engines::{create_capacity, fixed_base};
use crate::{PoolError, PoolOptions};

pub struct NoopEngine {
    base: *mut u8,
    capacity: usize,
}

// SAFETY: the heap is plain anonymous memory.
unsafe impl Send for NoopEngine {}
unsafe impl Sync for NoopEngine {}

impl NoopEngine {
    pub fn open(options: &PoolOptions) -> Result<Arc<dyn Engine>, PoolError> {
        let capacity = create_capacity(options);
        let base = map_anonymous(capacity, fixed_base(options))?;
        Ok(Arc::new(NoopEngine { base, capacity }))
    }
}

impl Engine for NoopEngine {
    fn checkpoint(&self, _nr_threads: u64) {}

    fn exist_snapshot(&self) -> bool {
        false
    }

    fn base_address(&self) -> *mut u8 {
        self.base
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for NoopEngine {
    fn drop(&mut self) {
        // SAFETY: base/capacity describe the mapping created in open.
        unsafe { unmap_anonymous(self.base, self.capacity) };
    }
}
