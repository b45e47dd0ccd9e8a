// Copyright (c) the crashpoint developers.
// SPDX-License-Identifier: Apache-2.0

//! Persistent file mapping.
//!
//! Creates or opens the image file backing a pool and maps it read-write at
//! a caller-chosen base address. The mapping first attempts synchronous DAX
//! semantics (`MAP_SHARED_VALIDATE | MAP_SYNC`), where a cache-line
//! write-back plus store fence is sufficient for durability, and falls back
//! to a plain shared mapping on filesystems without DAX support.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::{syserror, Error};

fn path_cstring(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::CapacityInvalid)
}

/// A fixed base is requested with `MAP_FIXED_NOREPLACE` so that an occupied
/// range fails the open instead of silently clobbering another mapping.
#[cfg(target_os = "linux")]
const MAP_FIXED_FLAG: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_FIXED_FLAG: libc::c_int = libc::MAP_FIXED;

unsafe fn map_file(
    fd: libc::c_int,
    len: usize,
    fixed_base: Option<usize>,
) -> Result<*mut u8, Error> {
    let (hint, fixed) = match fixed_base {
        Some(base) => (base as *mut libc::c_void, MAP_FIXED_FLAG),
        None => (std::ptr::null_mut(), 0),
    };

    #[cfg(target_os = "linux")]
    {
        let addr = libc::mmap(
            hint,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC | fixed,
            fd,
            0,
        );
        if addr != libc::MAP_FAILED {
            return Ok(addr.cast());
        }
        // Not a DAX mount; retry with a plain shared mapping. Durability then
        // relies on the kernel writeback of the shared mapping.
    }

    let addr = libc::mmap(
        hint,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | fixed,
        fd,
        0,
    );
    if addr == libc::MAP_FAILED {
        return syserror!("mmap image");
    }
    if let Some(base) = fixed_base {
        if addr as usize != base {
            libc::munmap(addr, len);
            return syserror!("mmap image at fixed base");
        }
    }
    Ok(addr.cast())
}

/// The image file mapped into the address space.
///
/// The mapping is unmapped and the descriptor closed on drop.
#[derive(Debug)]
pub struct FileMapping {
    fd: libc::c_int,
    addr: *mut u8,
    len: usize,
    path: PathBuf,
}

// SAFETY: the mapping itself carries no thread affinity; concurrent access
// to the mapped bytes is governed by the checkpoint protocol.
unsafe impl Send for FileMapping {}
unsafe impl Sync for FileMapping {}

impl FileMapping {
    /// Check whether an image file already exists and is accessible.
    pub fn exists(path: &Path) -> bool {
        let Ok(cpath) = path_cstring(path) else {
            return false;
        };
        // SAFETY: cpath is a valid C string.
        unsafe { libc::access(cpath.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
    }

    /// Remove an image file. Returns whether the removal succeeded.
    pub fn remove(path: &Path) -> bool {
        std::fs::remove_file(path).is_ok()
    }

    /// Create a fresh image file of `len` bytes and map it.
    ///
    /// The file is extended sparsely: a seek to the last byte plus a single
    /// write, so large images do not consume media until touched.
    pub fn create(path: &Path, len: usize, fixed_base: Option<usize>) -> Result<Self, Error> {
        if len == 0 {
            return Err(Error::CapacityInvalid);
        }
        let cpath = path_cstring(path)?;
        // SAFETY: cpath is a valid C string.
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                libc::S_IRUSR | libc::S_IWUSR,
            )
        };
        if fd < 0 {
            return syserror!("open image for create");
        }

        // SAFETY: fd is a valid descriptor; the write buffer is one byte.
        let ret = unsafe {
            if libc::lseek(fd, (len - 1) as libc::off_t, libc::SEEK_SET) < 0 {
                -1
            } else if libc::write(fd, b"\0".as_ptr().cast(), 1) != 1 {
                -1
            } else {
                libc::fsync(fd)
            }
        };
        if ret < 0 {
            // SAFETY: fd is valid and owned here.
            unsafe { libc::close(fd) };
            return syserror!("extend image file");
        }

        // SAFETY: fd is valid, len matches the file size.
        let addr = match unsafe { map_file(fd, len, fixed_base) } {
            Ok(addr) => addr,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        Ok(FileMapping {
            fd,
            addr,
            len,
            path: path.to_path_buf(),
        })
    }

    /// Map an existing image file at its full length.
    pub fn open(path: &Path, fixed_base: Option<usize>) -> Result<Self, Error> {
        let cpath = path_cstring(path)?;
        // SAFETY: cpath is a valid C string.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR, libc::S_IRUSR | libc::S_IWUSR) };
        if fd < 0 {
            return syserror!("open image");
        }

        // SAFETY: fd is a valid descriptor.
        let tail = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        if tail <= 0 {
            unsafe { libc::close(fd) };
            return syserror!("size image");
        }
        let len = tail as usize;

        // SAFETY: fd is valid, len matches the file size.
        let addr = match unsafe { map_file(fd, len, fixed_base) } {
            Ok(addr) => addr,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        Ok(FileMapping {
            fd,
            addr,
            len,
            path: path.to_path_buf(),
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Translate an image-relative offset to an absolute pointer.
    pub fn rel_to_abs(&self, rel: usize) -> *mut u8 {
        debug_assert!(rel <= self.len);
        // SAFETY: rel is bounded by the mapping length.
        unsafe { self.addr.add(rel) }
    }

    /// Translate an absolute pointer inside the mapping to its offset.
    pub fn abs_to_rel(&self, abs: *const u8) -> usize {
        abs as usize - self.addr as usize
    }

    /// Punch a hole over a media-errored range so that the next access
    /// reallocates fresh blocks instead of faulting again.
    pub fn clear_poison(&self, offset: usize, len: usize) -> Result<(), Error> {
        // SAFETY: fd is a valid descriptor owned by self.
        let ret = unsafe {
            libc::fallocate(
                self.fd,
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if ret < 0 {
            return syserror!("punch poisoned range");
        }
        // SAFETY: as above.
        let ret = unsafe {
            libc::fallocate(
                self.fd,
                libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if ret < 0 {
            return syserror!("reallocate poisoned range");
        }
        Ok(())
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        // SAFETY: addr/len describe a live mapping, fd is owned.
        unsafe {
            libc::munmap(self.addr.cast(), self.len);
            libc::close(self.fd);
        }
    }
}

/// Map `len` bytes of anonymous memory, optionally at a fixed base. Used for
/// the working heap of the DRAM-buffered engines and for image-free engines.
pub fn map_anonymous(len: usize, fixed_base: Option<usize>) -> Result<*mut u8, Error> {
    let (hint, fixed) = match fixed_base {
        Some(base) => (base as *mut libc::c_void, MAP_FIXED_FLAG),
        None => (std::ptr::null_mut(), 0),
    };
    // SAFETY: anonymous mapping, arguments are well-formed.
    let addr = unsafe {
        libc::mmap(
            hint,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | fixed,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return syserror!("mmap anonymous");
    }
    if let Some(base) = fixed_base {
        if addr as usize != base {
            // SAFETY: addr/len describe the mapping just created.
            unsafe { libc::munmap(addr, len) };
            return syserror!("mmap anonymous at fixed base");
        }
    }
    Ok(addr.cast())
}

/// Release a mapping obtained from [`map_anonymous`].
///
/// # Safety
/// `addr`/`len` must describe exactly one live anonymous mapping.
pub unsafe fn unmap_anonymous(addr: *mut u8, len: usize) {
    libc::munmap(addr.cast(), len);
}

#[cfg(test)]
mod t_mapping {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_then_open_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("image");

        let mapping = FileMapping::create(&path, 1 << 20, None).expect("create");
        assert_eq!(mapping.len(), 1 << 20);
        // SAFETY: offset is inside the mapping.
        unsafe { mapping.rel_to_abs(100).write(42) };
        drop(mapping);

        assert!(FileMapping::exists(&path));
        let mapping = FileMapping::open(&path, None).expect("open");
        assert_eq!(mapping.len(), 1 << 20);
        // SAFETY: offset is inside the mapping.
        assert_eq!(unsafe { mapping.rel_to_abs(100).read() }, 42);
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = TempDir::new().expect("tempdir");
        assert!(FileMapping::open(&dir.path().join("nope"), None).is_err());
    }

    #[test]
    fn fixed_base_is_honoured() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("image");
        let base = 0x0180_0000_0000usize;

        let mapping = FileMapping::create(&path, 1 << 20, Some(base)).expect("create fixed");
        assert_eq!(mapping.base() as usize, base);
        assert_eq!(mapping.abs_to_rel(mapping.rel_to_abs(4096)), 4096);
    }

    #[test]
    fn anonymous_mapping_roundtrip() {
        let addr = map_anonymous(1 << 20, None).expect("anon");
        // SAFETY: the mapping is live and 1 MiB long.
        unsafe {
            addr.write(7);
            assert_eq!(addr.read(), 7);
            unmap_anonymous(addr, 1 << 20);
        }
    }
}
