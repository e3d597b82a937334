// SPDX-License-Identifier: Apache-2.0 OR MIT

//! POSIX shared-memory mapping: `shm_open` + `ftruncate` + `mmap`.
//!
//! Directly modeled on `transport::shm::segment::ShmSegment` — same
//! three-syscall sequence, same "zero-fill on create, caller picks size on
//! open" contract, same documented `unsafe` blocks.
//! Unlike the three semaphores (opened, not created — that creation is
//! delegated to a setuid helper), the page itself is created directly by
//! [`crate::segment::SegmentAllocator::allocate`] and recreated in place
//! by `resize` (unmapped, truncated to the new size, zero-filled, and
//! remapped). [`ShmMapping::open`] exists for the non-authoritative
//! peer's side of a connection, which only ever attaches to a page this
//! side already created.

use crate::error::{Result, ShmifError};
use std::ffi::CString;
use std::io;
use std::ptr;

pub struct ShmMapping {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is `MAP_SHARED` memory meant to be read/written from
// multiple processes under semaphore protection defined by the caller;
// sharing the handle across threads within one process is no more unsafe
// than that.
unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    /// Create (or replace) a POSIX shared memory object and map it.
    /// The mapping is zero-filled.
    pub fn create(shm_name: &str, size: usize) -> Result<Self> {
        let c_name = CString::new(shm_name)
            .map_err(|_| ShmifError::BadArgument(format!("invalid shm name: {shm_name}")))?;

        // SAFETY: `c_name` is a valid NUL-terminated string. `shm_unlink`
        // is safe to call on a name that doesn't exist (errors ignored);
        // `shm_open` with `O_CREAT|O_EXCL` either creates a fresh object
        // or fails, checked below.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
        };
        if fd < 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }

        let ptr = match Self::truncate_and_map(fd, size) {
            Ok(p) => p,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        // SAFETY: `fd` is valid; the mapping above holds its own reference
        // to the object, so closing the descriptor here is safe.
        unsafe { libc::close(fd) };

        // SAFETY: `ptr` and `size` come from a just-completed successful
        // `mmap` of exactly `size` bytes with write permission.
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Ok(Self { ptr, size })
    }

    /// Open an existing shared memory object at its current size.
    pub fn open(shm_name: &str, size: usize) -> Result<Self> {
        let c_name = CString::new(shm_name)
            .map_err(|_| ShmifError::BadArgument(format!("invalid shm name: {shm_name}")))?;

        // SAFETY: `c_name` is a valid NUL-terminated string; `shm_open`
        // without `O_CREAT` either opens an existing object or fails.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }

        let ptr = Self::map_only(fd, size);
        // SAFETY: mapping (success or failure) does not need the fd kept
        // open afterward.
        unsafe { libc::close(fd) };
        let ptr = ptr?;

        Ok(Self { ptr, size })
    }

    fn truncate_and_map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY: `fd` is a valid fd from a just-completed `shm_open`;
        // `size` cast to `off_t` is bounded by normal segment sizes.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }
        Self::map_only(fd, size)
    }

    fn map_only(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY: null first argument lets the kernel choose the address;
        // `size` is the caller-supplied mapping length; `fd` is a valid,
        // open descriptor; offset 0 maps from the start of the object.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }
        Ok(ptr.cast::<u8>())
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Unlink the backing POSIX object's name. Best-effort.
    pub fn unlink(shm_name: &str) {
        if let Ok(c_name) = CString::new(shm_name) {
            // SAFETY: `shm_unlink` accepts any NUL-terminated path.
            unsafe {
                libc::shm_unlink(c_name.as_ptr());
            }
        }
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        // SAFETY: `self.ptr`/`self.size` describe the live mapping
        // established in `create`/`open`; `munmap` is idempotent from the
        // point of view of this handle since it only runs once on drop.
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
        }
    }
}
