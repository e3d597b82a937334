// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The rendezvous (connpoint) socket non-authoritative clients connect to.
//!
//! A filesystem stream socket, close-on-exec, bound to a path derived
//! from a compile-time prefix plus an optional `HOME` prefix plus the
//! caller's name, permissions set to a compile-time mask, listen
//! backlog of 1. The abstract namespace (prefix beginning with a NUL byte)
//! is supported on Linux. Built directly on `libc` socket calls — like
//! `transport::shm::segment`, not `std::os::unix::net::UnixListener` —
//! because the abstract-namespace path needs a `sockaddr_un` the standard
//! library does not expose a way to construct.

use crate::error::{Result, ShmifError};
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// Compile-time prefix for connpoint paths. Relative (doesn't start with
/// `/`), so it is resolved under `$HOME` when set, and under `/tmp`
/// otherwise.
pub const CONNPOINT_PREFIX: &str = ".shmif/";

/// Socket file permission mask applied after bind.
pub const CONNPOINT_MODE: libc::mode_t = 0o600;

/// `sockaddr_un.sun_path` capacity on Linux, including the NUL terminator.
pub const MAX_UNIX_PATH: usize = 108;

/// Resolve the full filesystem path for a connpoint `name`, honoring the
/// `HOME`-relative prefix. Fails if the result would not fit `sun_path`.
pub fn resolve_path(name: &str) -> Result<String> {
    let mut path = String::new();
    if let Ok(home) = std::env::var("HOME") {
        path.push_str(&home);
        path.push('/');
    } else {
        path.push_str("/tmp/");
    }
    path.push_str(CONNPOINT_PREFIX);
    path.push_str(name);

    if path.len() + 1 > MAX_UNIX_PATH {
        return Err(ShmifError::PathTooLong { len: path.len() + 1, max: MAX_UNIX_PATH });
    }
    Ok(path)
}

/// An owned, listening rendezvous socket.
pub struct RendezvousSocket {
    fd: RawFd,
    path: String,
}

impl RendezvousSocket {
    /// Bind and listen on the connpoint for `name`. Any stale file at the
    /// resolved path is unlinked first.
    pub fn bind(name: &str) -> Result<Self> {
        let path = resolve_path(name)?;
        let _ = std::fs::remove_file(&path);

        // SAFETY: `AF_UNIX`/`SOCK_STREAM` is a valid, always-available
        // socket domain/type pair; `SOCK_CLOEXEC` is OR'd into the type to
        // get an atomically close-on-exec descriptor (avoiding a
        // fork+exec race against a concurrent `fcntl`).
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }

        if let Err(e) = Self::bind_and_listen(fd, &path) {
            // SAFETY: `fd` is valid and exclusively owned here.
            unsafe { libc::close(fd) };
            return Err(e);
        }

        // SAFETY: `path` was just used to successfully `bind`; `chmod` on
        // an existing path is always a valid call.
        let c_path = CString::new(path.clone())
            .map_err(|_| ShmifError::BadArgument("connpoint path has interior NUL".into()))?;
        unsafe {
            libc::chmod(c_path.as_ptr(), CONNPOINT_MODE);
        }

        Ok(Self { fd, path })
    }

    fn bind_and_listen(fd: RawFd, path: &str) -> Result<()> {
        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let bytes = path.as_bytes();
        if bytes.len() + 1 > addr.sun_path.len() {
            return Err(ShmifError::PathTooLong { len: bytes.len() + 1, max: addr.sun_path.len() });
        }
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
            *dst = *src as libc::c_char;
        }

        let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
        // SAFETY: `addr` is a fully initialized `sockaddr_un` whose
        // `sun_path` holds `bytes` plus a trailing NUL (left zeroed by
        // `mem::zeroed`); `len` matches the populated prefix.
        let ret = unsafe {
            libc::bind(fd, (&addr as *const libc::sockaddr_un).cast(), len as libc::socklen_t)
        };
        if ret < 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }

        // Backlog of 1: only one client is ever meant to bind to a given
        // rendezvous socket.
        // SAFETY: `fd` is the just-bound socket.
        let ret = unsafe { libc::listen(fd, 1) };
        if ret < 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Non-blocking accept. `Ok(None)` means no pending connection
    /// (`EAGAIN`/`EWOULDBLOCK`).
    pub fn accept_nonblocking(&self) -> Result<Option<RawFd>> {
        // SAFETY: `self.fd` is valid for the lifetime of `self`.
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }
        // SAFETY: setting `O_NONBLOCK` on a valid fd is always sound.
        unsafe {
            libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        // SAFETY: `self.fd` is a valid, listening socket; null
        // address/len pointers are explicitly allowed by `accept(2)` when
        // the peer address is not needed.
        let client = unsafe { libc::accept4(self.fd, ptr_null_mut(), ptr_null_mut(), libc::SOCK_CLOEXEC) };
        if client < 0 {
            let err = io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)) {
                return Ok(None);
            }
            return Err(ShmifError::ResourceExhausted(err));
        }
        Ok(Some(client))
    }

    /// Unlink the socket path. Called immediately after a successful
    /// accept (the `LISTEN` → `VERIFYING` transition) and again, best
    /// effort, on teardown.
    pub fn unlink(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn ptr_null_mut<T>() -> *mut T {
    std::ptr::null_mut()
}

impl Drop for RendezvousSocket {
    fn drop(&mut self) {
        // SAFETY: `self.fd` is the valid, owned listening socket created
        // in `bind`.
        unsafe {
            libc::close(self.fd);
        }
    }
}
