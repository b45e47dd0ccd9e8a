// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide engine registry.
//!
//! The instrumentation hooks receive bare addresses and must find the engine
//! owning them. Engines register their working-heap range here; lookups do a
//! binary search on the range starts, with the common single-engine case
//! short-circuited.

use std::sync::{Arc, RwLock, Weak};

use lazy_static::lazy_static;

use crate::engine::Engine;

struct Registered {
    start: usize,
    end: usize,
    engine: Weak<dyn Engine>,
}

lazy_static! {
    static ref ENGINES: RwLock<Vec<Registered>> = RwLock::new(Vec::new());
}

pub fn register(engine: &Arc<dyn Engine>) {
    let (start, end) = engine.address_range();
    let mut engines = ENGINES.write().expect("engine registry poisoned");
    let pos = engines.partition_point(|e| e.start < start);
    engines.insert(
        pos,
        Registered {
            start,
            end,
            engine: Arc::downgrade(engine),
        },
    );
}

pub fn unregister(range: (usize, usize)) {
    let mut engines = ENGINES.write().expect("engine registry poisoned");
    engines.retain(|e| (e.start, e.end) != range);
}

fn lookup(engines: &[Registered], addr: usize) -> Option<Arc<dyn Engine>> {
    let pos = engines.partition_point(|e| e.start <= addr);
    if pos == 0 {
        return None;
    }
    let candidate = &engines[pos - 1];
    if addr < candidate.end {
        candidate.engine.upgrade()
    } else {
        None
    }
}

/// Find the engine owning `addr`.
pub fn find(addr: usize) -> Option<Arc<dyn Engine>> {
    let engines = ENGINES.read().expect("engine registry poisoned");
    lookup(&engines, addr)
}

/// Route a single-store hook.
pub fn dispatch_store(addr: usize) {
    if let Some(engine) = find(addr) {
        engine.on_store(addr);
    }
}

/// Route a range-store hook.
pub fn dispatch_range(addr: usize, len: usize) {
    if let Some(engine) = find(addr) {
        engine.on_range_store(addr, len);
    }
}

/// Drain a batch of buffered store addresses. Resolves the engine once when
/// a single engine is registered, which is the steady state.
pub fn dispatch_batch(addrs: &[u64]) {
    let engines = ENGINES.read().expect("engine registry poisoned");
    if engines.len() == 1 {
        let entry = &engines[0];
        if let Some(engine) = entry.engine.upgrade() {
            for &addr in addrs {
                let addr = addr as usize;
                if addr >= entry.start && addr < entry.end {
                    engine.on_store(addr);
                }
            }
        }
        return;
    }
    for &addr in addrs {
        if let Some(engine) = lookup(&engines, addr as usize) {
            engine.on_store(addr as usize);
        }
    }
}
