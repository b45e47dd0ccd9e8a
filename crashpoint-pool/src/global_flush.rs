// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Cache-wide write-back.
//!
//! When the per-thread block buffers overflow, selective flushing is no
//! longer possible and the engines fall back to a global cache write-back.
//! A kernel module exposing `/dev/global_flush` performs `wbinvd` on every
//! CPU; when the device is absent the callers walk the dirty-segment bitmap
//! and issue cache-line write-backs instead, which is slower but has the
//! same durability effect.

use std::sync::OnceLock;

use tracing::{debug, warn};

pub struct GlobalFlush {
    fd: Option<libc::c_int>,
}

// SAFETY: the descriptor is only ever written to, which is thread-safe.
unsafe impl Send for GlobalFlush {}
unsafe impl Sync for GlobalFlush {}

static GLOBAL_FLUSH: OnceLock<GlobalFlush> = OnceLock::new();

impl GlobalFlush {
    pub fn get() -> &'static GlobalFlush {
        GLOBAL_FLUSH.get_or_init(|| {
            // SAFETY: opening a device path is always safe to attempt.
            let fd =
                unsafe { libc::open(b"/dev/global_flush\0".as_ptr().cast(), libc::O_RDWR) };
            if fd < 0 {
                warn!("/dev/global_flush unavailable, falling back to cache-line write-back");
                GlobalFlush { fd: None }
            } else {
                debug!("using /dev/global_flush for cache-wide write-back");
                GlobalFlush { fd: Some(fd) }
            }
        })
    }

    /// Invalidate every CPU's caches through the device. Returns false when
    /// the device is unavailable and the caller must flush selectively.
    pub fn flush(&self) -> bool {
        let Some(fd) = self.fd else {
            return false;
        };
        // SAFETY: fd is a valid descriptor; a zero-length write triggers the
        // module's wbinvd path.
        let ret = unsafe { libc::write(fd, b"".as_ptr().cast(), 0) };
        ret >= 0
    }
}

#[cfg(test)]
mod t_global_flush {
    use super::*;

    #[test]
    fn flush_never_panics() {
        // On development machines the device is typically absent and flush
        // reports the fallback.
        let _ = GlobalFlush::get().flush();
    }
}
