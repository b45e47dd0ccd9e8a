// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios against the instrumented engine through the public
//! pool API. Tests double as crash simulations: mutating after a checkpoint
//! and dropping the pool without another commit models a crash, and the
//! reopened pool must present exactly the last committed state.
//!
//! Geometry used throughout: 256 B blocks, 2 MiB segments, 64 main
//! segments (128 MiB heap), 16 back segments.

use std::path::{Path, PathBuf};

use serial_test::serial;
use tempfile::TempDir;

use crashpoint_core::{BLOCK_SIZE, SEGMENT_SIZE};
use crashpoint_pool::{annotate_checkpoint_region, Pool, PoolOptions, SegmentState};

const HEAP_CAPACITY: usize = 128 << 20;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn options(base: usize) -> PoolOptions {
    PoolOptions {
        create: true,
        capacity: HEAP_CAPACITY,
        shadow_capacity_factor: 0.25, // 16 back segments
        fixed_base_address: base,
        ..PoolOptions::default()
    }
}

fn image_path(dir: &TempDir) -> PathBuf {
    dir.path().join("pool-image")
}

/// Write `len` patterned bytes at `ptr` and announce them to the tracker,
/// the way instrumented stores would.
unsafe fn write_pattern(ptr: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        ptr.add(i).write(seed.wrapping_add((i % 251) as u8));
    }
    annotate_checkpoint_region(ptr, len);
}

unsafe fn check_pattern(ptr: *const u8, len: usize, seed: u8) -> bool {
    (0..len).all(|i| ptr.add(i).read() == seed.wrapping_add((i % 251) as u8))
}

/// A committed allocation reappears through the root table on reopen.
#[test]
#[serial]
fn committed_pattern_survives_reopen() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0300_0000_0000usize;

    {
        let pool = Pool::open(&path, &options(base)).expect("create pool");
        let data = pool.alloc(4096).expect("alloc");
        pool.set_root(0, data.as_ptr()).expect("root");
        unsafe { write_pattern(data.as_ptr(), 4096, b'A') };
        pool.checkpoint(1);
    }

    let pool = Pool::open(&path, &options(base)).expect("reopen pool");
    let data = pool.get_root(0);
    assert!(!data.is_null());
    assert!(unsafe { check_pattern(data, 4096, b'A') });
}

/// A store after the commit, never checkpointed, must be lost; the commit
/// is authoritative.
#[test]
#[serial]
fn post_checkpoint_write_is_lost() {
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0308_0000_0000usize;

    {
        let pool = Pool::open(&path, &options(base)).expect("create pool");
        let data = pool.alloc(4096).expect("alloc");
        pool.set_root(0, data.as_ptr()).expect("root");
        unsafe { write_pattern(data.as_ptr(), 4096, b'A') };
        pool.checkpoint(1);
        // Crash window: overwrite byte 0 and die without committing.
        unsafe {
            data.as_ptr().write(b'Z');
            annotate_checkpoint_region(data.as_ptr(), 1);
        }
    }

    let pool = Pool::open(&path, &options(base)).expect("reopen pool");
    let data = pool.get_root(0);
    assert_eq!(unsafe { data.read() }, b'A');
    assert!(unsafe { check_pattern(data, 4096, b'A') });
}

/// With only segment 7 modified between two checkpoints, its state follows
/// the committed epoch's direction and both sides hold the bytes.
#[test]
#[serial]
fn segment_state_tracks_epoch_direction() {
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0310_0000_0000usize;

    let pool = Pool::open(&path, &options(base)).expect("create pool");
    let seg7 = unsafe { pool.base_address().add(7 * SEGMENT_SIZE) };

    unsafe { write_pattern(seg7, 8192, b'Q') };
    pool.checkpoint(1);
    let epoch = pool.engine().committed_epoch();
    let expect = if epoch & 1 == 1 {
        SegmentState::Back
    } else {
        SegmentState::Main
    };
    assert_eq!(pool.engine().segment_state(7), Some(expect));

    unsafe { write_pattern(seg7, 8192, b'R') };
    pool.checkpoint(1);
    let epoch = pool.engine().committed_epoch();
    let expect = if epoch & 1 == 1 {
        SegmentState::Back
    } else {
        SegmentState::Main
    };
    assert_eq!(pool.engine().segment_state(7), Some(expect));

    // Both sides hold the committed bytes: a reopen from either direction
    // of the state machine yields the same data.
    drop(pool);
    let pool = Pool::open(&path, &options(base)).expect("reopen pool");
    let seg7 = unsafe { pool.base_address().add(7 * SEGMENT_SIZE) };
    assert!(unsafe { check_pattern(seg7, 8192, b'R') });
}

/// Filling a per-thread buffer to capacity forces the lossy mode; all
/// dirty segments transition and the bitmaps drain once the background
/// mirror finishes.
#[test]
#[serial]
fn full_buffers_force_global_writeback() {
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0318_0000_0000usize;

    let pool = Pool::open(&path, &options(base)).expect("create pool");
    // Commit the allocator-initialisation dirt so the big write below is
    // the only content of its checkpoint interval.
    pool.checkpoint(1);

    // 32 MiB of distinct dirty blocks across segments 1..17 = exactly the
    // per-thread buffer capacity.
    let heap = pool.base_address();
    let start = SEGMENT_SIZE;
    let span = 16 * SEGMENT_SIZE;
    unsafe {
        for block in 0..(span / BLOCK_SIZE) {
            let ptr = heap.add(start + block * BLOCK_SIZE);
            ptr.write(0xd1);
            annotate_checkpoint_region(ptr, 1);
        }
    }
    pool.checkpoint(1);
    pool.wait_for_background_task();

    for segment in 1..17u64 {
        let state = pool.engine().segment_state(segment).expect("state");
        assert_ne!(state, SegmentState::Initial, "segment {segment}");
    }
    assert!(
        !pool.engine().has_pending_dirty(),
        "dirty bitmaps must drain after the background mirror"
    );

    drop(pool);
    let pool = Pool::open(&path, &options(base)).expect("reopen pool");
    let heap = pool.base_address();
    unsafe {
        for block in 0..(span / BLOCK_SIZE) {
            assert_eq!(heap.add(start + block * BLOCK_SIZE).read(), 0xd1);
        }
    }
}

/// Dirty-bit closure in the common block-list mode.
#[test]
#[serial]
fn bitmaps_clear_after_checkpoint() {
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0320_0000_0000usize;

    let pool = Pool::open(&path, &options(base)).expect("create pool");
    let data = pool.alloc(1 << 20).expect("alloc");
    unsafe { write_pattern(data.as_ptr(), 1 << 20, 3) };
    assert!(pool.engine().has_pending_dirty());
    pool.checkpoint(1);
    pool.wait_for_background_task();
    assert!(!pool.engine().has_pending_dirty());
}

/// With every shadow slot bound, the next distinct dirty segment in a
/// later checkpoint steals a slot whose main is clean this epoch, and the
/// binding stays consistent both ways.
#[test]
#[serial]
fn shadow_reuse_prefers_clean_mains() {
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0328_0000_0000usize;

    let pool = Pool::open(&path, &options(base)).expect("create pool");
    let heap = pool.base_address();
    // Commit the allocator-initialisation dirt on its own first.
    pool.checkpoint(1);

    // Occupy all 16 shadow slots: one dirty block in each of 16 fresh
    // segments; the mirror pass rebinds every slot to them.
    unsafe {
        for segment in 16..32 {
            write_pattern(heap.add(segment * SEGMENT_SIZE), 256, segment as u8);
        }
    }
    pool.checkpoint(1);

    // A 17th distinct segment in a later interval must reuse a slot whose
    // main is clean this epoch rather than silently discarding the update.
    unsafe { write_pattern(heap.add(40 * SEGMENT_SIZE), 256, 0x40) };
    pool.checkpoint(1);
    assert_eq!(
        pool.engine().segment_state(40),
        Some(SegmentState::Back),
        "the rebound slot carries the new commit"
    );

    // Nothing was discarded: the stolen slot's former owner still recovers
    // from its main copy.
    drop(pool);
    let pool = Pool::open(&path, &options(base)).expect("reopen pool");
    let heap = pool.base_address();
    unsafe {
        assert!(check_pattern(heap.add(40 * SEGMENT_SIZE), 256, 0x40));
        for segment in 16..32 {
            assert!(check_pattern(
                heap.add(segment * SEGMENT_SIZE),
                256,
                segment as u8
            ));
        }
    }
}

/// Seventeen distinct dirty segments inside one checkpoint interval exceed
/// the sixteen-slot shadow arena and must abort, never silently drop an
/// update. Runs the scenario in a child process and asserts it died.
#[test]
#[serial]
fn shadow_exhaustion_aborts() {
    if std::env::var("CRASHPOINT_EXHAUSTION_CHILD").is_ok() {
        let dir = TempDir::new().expect("tempdir");
        let path = image_path(&dir);
        let pool = Pool::open(&path, &options(0x0330_0000_0000)).expect("create pool");
        let heap = pool.base_address();
        unsafe {
            for segment in 0..17 {
                write_pattern(heap.add(segment * SEGMENT_SIZE), 256, segment as u8);
            }
        }
        pool.checkpoint(1); // must abort: 17 segments, 16 slots, all dirty
        unreachable!("checkpoint must not survive shadow exhaustion");
    }

    let exe = std::env::current_exe().expect("test binary path");
    let status = std::process::Command::new(exe)
        .args(["shadow_exhaustion_aborts", "--exact", "--nocapture"])
        .env("CRASHPOINT_EXHAUSTION_CHILD", "1")
        .status()
        .expect("spawn child");
    assert!(!status.success(), "child must abort on shadow exhaustion");
}

/// The protocol tolerates multiple mutator threads entering checkpoint
/// together, with writes from every thread committed.
#[test]
#[serial]
fn multi_thread_checkpoint_commits_all_writers() {
    const THREADS: usize = 4;
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0338_0000_0000usize;

    {
        let pool = Pool::open(&path, &options(base)).expect("create pool");
        let heap = pool.base_address() as usize;
        std::thread::scope(|scope| {
            for tid in 0..THREADS {
                let pool = pool.clone();
                scope.spawn(move || {
                    let ptr = (heap + tid * SEGMENT_SIZE + 32 * SEGMENT_SIZE) as *mut u8;
                    unsafe { write_pattern(ptr, 4096, tid as u8) };
                    pool.checkpoint(THREADS as u64);
                });
            }
        });
    }

    let pool = Pool::open(&path, &options(base)).expect("reopen pool");
    let heap = pool.base_address() as usize;
    for tid in 0..THREADS {
        let ptr = (heap + tid * SEGMENT_SIZE + 32 * SEGMENT_SIZE) as *const u8;
        assert!(unsafe { check_pattern(ptr, 4096, tid as u8) }, "thread {tid}");
    }
}

/// Reopening twice in a row (recovery run twice) is indistinguishable from
/// reopening once.
#[test]
#[serial]
fn recovery_is_idempotent_across_reopens() {
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0340_0000_0000usize;

    {
        let pool = Pool::open(&path, &options(base)).expect("create pool");
        let data = pool.alloc(8192).expect("alloc");
        pool.set_root(5, data.as_ptr()).expect("root");
        unsafe { write_pattern(data.as_ptr(), 8192, 0x5c) };
        pool.checkpoint(1);
    }

    for _ in 0..2 {
        let pool = Pool::open(&path, &options(base)).expect("reopen pool");
        let data = pool.get_root(5);
        assert!(unsafe { check_pattern(data, 8192, 0x5c) });
    }
}

/// Repeated checkpoints alternate arenas; every committed generation is the
/// one that reappears.
#[test]
#[serial]
fn alternating_epochs_always_recover_latest() {
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0348_0000_0000usize;

    for round in 0..5u8 {
        let pool = Pool::open(&path, &options(base)).expect("pool");
        let data = if round == 0 {
            let data = pool.alloc(4096).expect("alloc");
            pool.set_root(0, data.as_ptr()).expect("root");
            data.as_ptr()
        } else {
            let data = pool.get_root(0);
            assert!(
                unsafe { check_pattern(data, 4096, round - 1) },
                "round {round} sees the previous commit"
            );
            data
        };
        unsafe { write_pattern(data, 4096, round) };
        pool.checkpoint(1);
    }
}

/// A checkpoint with no dirty data commits nothing and returns immediately.
#[test]
#[serial]
fn empty_checkpoint_is_a_no_op() {
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let base = 0x0350_0000_0000usize;

    let pool = Pool::open(&path, &options(base)).expect("create pool");
    // Flush the allocator-initialisation dirt first.
    pool.checkpoint(1);

    let before = pool.engine().committed_epoch();
    pool.checkpoint(1);
    assert_eq!(pool.engine().committed_epoch(), before);

    let data = pool.alloc(64).expect("alloc");
    unsafe { write_pattern(data.as_ptr(), 64, 1) };
    pool.checkpoint(1);
    let committed = pool.engine().committed_epoch();
    assert_eq!(committed, before + 1);

    // Clean again: still a no-op.
    pool.checkpoint(1);
    assert_eq!(pool.engine().committed_epoch(), committed);
}

/// The image rejects foreign files.
#[test]
#[serial]
fn garbage_file_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let path: &Path = &image_path(&dir);
    std::fs::write(path, vec![0xab; 4 << 20]).expect("write garbage");

    let mut opts = options(0x0358_0000_0000);
    opts.create = true; // exists, so no truncation happens
    assert!(Pool::open(path, &opts).is_err());
}
