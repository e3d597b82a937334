// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Descriptor passing (`SCM_RIGHTS`) over a control socket.
//!
//! Used by the child spawner to hand the inherited socket pair's parent end
//! across `fork`, and by the subsegment broker to push a fresh socket fd to
//! an already-running child. The ancillary-message
//! plumbing follows the `sendmsg`/`SCM_RIGHTS` pattern used for PTY fd
//! transfer in the reference broker implementation this module is modeled
//! on: build a one-byte `iovec` (descriptor passing needs at least one byte
//! of regular data to carry the ancillary data), attach a `cmsghdr` of type
//! `SCM_RIGHTS`, and let `O_CLOEXEC` on the passed fd be harmless (cloexec
//! is process-scoped and does not block the `SCM_RIGHTS` transfer itself).

use crate::error::{Result, ShmifError};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

/// Send `fd` as ancillary data over `socket`, along with a one-byte
/// payload (`tag`) the receiver can correlate with the out-of-band
/// `FDTRANSFER` event it also enqueues.
pub fn send_fd(socket: &UnixDatagram, fd: RawFd, tag: u8) -> Result<()> {
    let iov = libc::iovec {
        iov_base: (&tag as *const u8 as *mut u8).cast(),
        iov_len: 1,
    };

    // SAFETY: `CMSG_SPACE` is a compile-time-sized constant computation
    // over a `libc::c_uint`; no pointers are dereferenced here.
    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len();

    // SAFETY: `msg.msg_control` points to `cmsg_buf`, which is large
    // enough (by construction via `CMSG_SPACE`) to hold one `cmsghdr` plus
    // a single `RawFd`. `CMSG_FIRSTHDR`/`CMSG_DATA` only compute offsets
    // into that buffer.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(ShmifError::BadArgument("no room for SCM_RIGHTS header".into()));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
    }

    // SAFETY: `socket.as_raw_fd()` is a valid, open datagram socket for the
    // lifetime of this call; `msg` describes a well-formed ancillary
    // message as constructed above.
    let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
    }
    Ok(())
}

/// Receive a single descriptor sent with [`send_fd`], if any arrived. The
/// one-byte payload tag is returned alongside the descriptor.
pub fn recv_fd(socket: &UnixDatagram) -> Result<Option<(RawFd, u8)>> {
    let mut tag: u8 = 0;
    let iov = libc::iovec {
        iov_base: (&mut tag as *mut u8).cast(),
        iov_len: 1,
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len();

    // SAFETY: `socket.as_raw_fd()` is valid; `msg` points at buffers of
    // the sizes declared in its `msg_iovlen`/`msg_controllen` fields.
    let received = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(ShmifError::ResourceExhausted(err));
    }
    if received == 0 {
        return Ok(None);
    }

    // SAFETY: `msg` was populated by the successful `recvmsg` above;
    // `CMSG_FIRSTHDR`/`CMSG_DATA` only compute offsets within the control
    // buffer that `recvmsg` filled in.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Ok(None);
        }
        let fd = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
        Ok(Some((fd, tag)))
    }
}
