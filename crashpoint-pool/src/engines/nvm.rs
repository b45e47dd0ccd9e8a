// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Direct-mapped engine: the heap is the image file itself, mapped with
//! synchronous durability semantics where available. There is no checkpoint
//! state; every store is durable on writeback. Recovery semantics are
//! whatever the media last absorbed.

use std::path::Path;
use std::sync::Arc;

use crashpoint_core::mapping::FileMapping;

use crate::engine::Engine;
use crate::engines::{create_capacity, fixed_base};
use crate::{PoolError, PoolOptions};

pub struct NvmEngine {
    mapping: FileMapping,
}

impl NvmEngine {
    pub fn open(path: &Path, options: &PoolOptions) -> Result<Arc<dyn Engine>, PoolError> {
        let create = options.create && (options.truncate || !FileMapping::exists(path));
        let mapping = if create {
            FileMapping::create(path, create_capacity(options), fixed_base(options))?
        } else {
            FileMapping::open(path, fixed_base(options))?
        };
        Ok(Arc::new(NvmEngine { mapping }))
    }
}

impl Engine for NvmEngine {
    fn checkpoint(&self, _nr_threads: u64) {}

    fn exist_snapshot(&self) -> bool {
        false
    }

    fn base_address(&self) -> *mut u8 {
        self.mapping.base()
    }

    fn capacity(&self) -> usize {
        self.mapping.len()
    }
}

#[cfg(test)]
mod t_nvm {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bytes_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nvm");
        let options = PoolOptions {
            create: true,
            fixed_base_address: 0,
            ..PoolOptions::default()
        };

        let engine = NvmEngine::open(&path, &options).expect("create");
        // SAFETY: inside the mapped heap.
        unsafe { engine.base_address().add(100).write(0x5a) };
        drop(engine);

        let engine = NvmEngine::open(&path, &options).expect("reopen");
        // SAFETY: inside the mapped heap.
        assert_eq!(unsafe { engine.base_address().add(100).read() }, 0x5a);
    }
}
