// SPDX-License-Identifier: Apache-2.0 OR MIT

//! POSIX counting semaphores, named from a segment's key.
//!
//! Mirrors the POSIX-wrapper style of `transport::shm::segment::ShmSegment`:
//! thin, documented `unsafe` blocks around `libc` calls, with ownership
//! expressed by a `Drop` impl rather than a manual close call at every use
//! site.
//!
//! The three semaphores are *opened*, not created — in the reference
//! design, segment creation (and therefore
//! `sem_open` with `O_CREAT`) is delegated to a setuid helper the host
//! trusts, since that helper is the privileged component that can hand
//! out access to unprivileged peers. A single-process host with no such
//! helper installed still needs the names to come from somewhere, so
//! `open` here creates the semaphore if the name does not already exist
//! (`O_CREAT` without `O_EXCL`) and otherwise opens whatever the external
//! helper already created — the common case in a split-privilege
//! deployment, and the only case in a standalone one.

use crate::error::{Result, ShmifError};
use crate::key::SegmentKey;
use std::ffi::CString;
use std::io;

/// One of a segment's three named counting semaphores.
pub struct Semaphore {
    handle: *mut libc::sem_t,
    name: String,
}

// SAFETY: `sem_t` is designed for cross-process, cross-thread use; all
// operations on it (`sem_post`, `sem_wait`, `sem_trywait`) are documented
// as thread-safe by POSIX.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Open a named semaphore, creating it at an initial count of zero
    /// if no process has created it yet.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| ShmifError::BadArgument(format!("semaphore name has interior NUL: {name}")))?;

        // SAFETY: `c_name` is a valid NUL-terminated string; `sem_open`
        // with `O_CREAT` (no `O_EXCL`) either opens the existing object a
        // privileged helper created, or creates a fresh one at count 0,
        // returning `SEM_FAILED` only on genuine failure, checked below.
        let handle = unsafe {
            libc::sem_open(c_name.as_ptr(), libc::O_CREAT, 0o600 as libc::mode_t, 0u32)
        };
        if handle == libc::SEM_FAILED {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }

        Ok(Self { handle, name: name.to_string() })
    }

    /// Increment the semaphore, waking one waiter if any.
    pub fn post(&self) -> Result<()> {
        // SAFETY: `self.handle` was returned by a successful `sem_open`
        // and has not been closed (enforced by `Drop`).
        let ret = unsafe { libc::sem_post(self.handle) };
        if ret != 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Block until the semaphore is non-zero, then decrement it.
    pub fn wait(&self) -> Result<()> {
        // SAFETY: see `post`.
        let ret = unsafe { libc::sem_wait(self.handle) };
        if ret != 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Non-blocking variant of [`Semaphore::wait`]; `Ok(false)` means the
    /// semaphore was zero (`EAGAIN`).
    pub fn try_wait(&self) -> Result<bool> {
        // SAFETY: see `post`.
        let ret = unsafe { libc::sem_trywait(self.handle) };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(false);
        }
        Err(ShmifError::ResourceExhausted(err))
    }

    /// Unlink the semaphore's name from the namespace. Idempotent from the
    /// caller's point of view: errors are ignored, matching `release`'s
    /// best-effort teardown.
    pub fn unlink(name: &str) {
        if let Ok(c_name) = CString::new(name) {
            // SAFETY: `sem_unlink` accepts any NUL-terminated path and is
            // safe to call even if the name doesn't exist.
            unsafe {
                libc::sem_unlink(c_name.as_ptr());
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: `self.handle` is only ever a valid, not-yet-closed
        // `sem_t*` obtained from `sem_open` in `Self::open`.
        unsafe {
            libc::sem_close(self.handle);
        }
    }
}

/// The three named semaphores a live segment exposes, keyed from the
/// segment's [`SegmentKey`].
pub struct SegmentSemaphores {
    pub video: Semaphore,
    pub audio: Semaphore,
    pub event: Semaphore,
}

impl SegmentSemaphores {
    pub fn open(key: &SegmentKey) -> Result<Self> {
        Ok(Self {
            video: Semaphore::open(&key.posix_semaphore_name(b'v'))?,
            audio: Semaphore::open(&key.posix_semaphore_name(b'a'))?,
            event: Semaphore::open(&key.posix_semaphore_name(b'e'))?,
        })
    }

    /// Unlink all three names. Best-effort; see [`Semaphore::unlink`].
    pub fn unlink_all(key: &SegmentKey) {
        Semaphore::unlink(&key.posix_semaphore_name(b'v'));
        Semaphore::unlink(&key.posix_semaphore_name(b'a'));
        Semaphore::unlink(&key.posix_semaphore_name(b'e'));
    }
}
