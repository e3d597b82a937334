// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The non-authoritative connection state machine.
//!
//! The most delicate component: an external, untrusted peer connects to
//! the rendezvous socket, optionally proves knowledge of a pre-shared key,
//! and only then learns the segment key that grants it access to the
//! shared page and semaphores.
//!
//! The reference design overloads a single per-frame callback with
//! different raw function pointers swapped in as the state changes
//! (`socketpoll` -> `socketverify` -> `emptyframe`). Here the state lives
//! explicitly on [`crate::segment::Segment::state`] as a
//! [`crate::segment::SegmentState`] and [`drive`] dispatches on it.

use crate::error::{Result, ShmifError};
use crate::host::HostCallbacks;
use crate::key::{SegmentKey, KEY_LEN};
use crate::metrics::global_metrics;
use crate::rendezvous::RendezvousSocket;
use crate::segment::{Segment, SegmentState, EXPECTED_KEY_LEN};
use std::io;
use std::os::unix::io::RawFd;

/// The two events the host's per-frame poll drives the state machine
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Poll,
    Destroy,
}

/// Number of non-blocking write retries the send-key path allows before
/// giving up.
const SEND_KEY_RETRIES: u32 = 10;

/// An accepted, non-blocking peer connection. Owns the descriptor; closed
/// on drop. Used both for the handshake's byte-at-a-time reads and, once
/// `LIVE`, as the bidirectional event-queue transport.
pub struct ClientSocket {
    fd: RawFd,
}

impl ClientSocket {
    /// Wrap a freshly accepted descriptor and make it non-blocking. The
    /// descriptor is assumed already close-on-exec (set by
    /// [`RendezvousSocket::accept_nonblocking`]'s `accept4`).
    pub(crate) fn from_accepted(fd: RawFd) -> Result<Self> {
        // SAFETY: `fd` was just returned by a successful `accept4` and is
        // exclusively owned by the caller at this point.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }
        // SAFETY: see above.
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(ShmifError::ResourceExhausted(io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Read exactly one byte, non-blocking. `Ok(None)` means nothing is
    /// available yet (`EAGAIN`/`EWOULDBLOCK`).
    fn read_byte(&self) -> Result<Option<u8>> {
        let mut byte: u8 = 0;
        // SAFETY: `self.fd` is open and owned by `self`; the buffer is a
        // single stack byte, large enough for the requested length.
        let n = unsafe {
            libc::recv(self.fd, (&mut byte as *mut u8).cast(), 1, 0)
        };
        if n > 0 {
            return Ok(Some(byte));
        }
        if n == 0 {
            // Peer closed the connection mid-handshake.
            return Err(ShmifError::ProtocolViolation("peer closed during handshake".into()));
        }
        let err = io::Error::last_os_error();
        if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)) {
            return Ok(None);
        }
        Err(ShmifError::ResourceExhausted(err))
    }

    /// Write `buf` in full, retrying up to [`SEND_KEY_RETRIES`] times and
    /// treating `EAGAIN`/`EWOULDBLOCK`/`EINTR` as retryable. Returns
    /// `Ok(false)` on retry exhaustion.
    fn write_all_retrying(&self, buf: &[u8]) -> Result<bool> {
        let mut written = 0usize;
        for _ in 0..SEND_KEY_RETRIES {
            if written == buf.len() {
                return Ok(true);
            }
            // SAFETY: `self.fd` is open and owned by `self`; `buf` is a
            // valid slice and `written` never exceeds its length.
            let n = unsafe {
                libc::send(
                    self.fd,
                    buf[written..].as_ptr().cast(),
                    buf.len() - written,
                    0,
                )
            };
            if n >= 0 {
                written += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => continue,
                _ => return Err(ShmifError::ResourceExhausted(err)),
            }
        }
        Ok(written == buf.len())
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        // SAFETY: `self.fd` is the descriptor this handle exclusively
        // owns, created in `from_accepted`.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Drive `segment` through one state-machine tick in response to `cmd`.
/// `host` is only consulted on the `LIVE` transition (registering the
/// real per-frame renderer and attaching the audio feed — never before,
/// since no audio feed is ever attached while `state != LIVE`).
pub fn drive(segment: &mut Segment, host: &dyn HostCallbacks, cmd: Command) {
    if cmd == Command::Destroy {
        log::debug!("segment {}: DESTROY -> DEAD", segment.key);
        segment.state = SegmentState::Dead;
        return;
    }

    match segment.state {
        SegmentState::Listen => poll_listen(segment, host),
        SegmentState::Verifying => poll_verifying(segment, host),
        SegmentState::Live | SegmentState::Dead => {}
    }
}

fn poll_listen(segment: &mut Segment, host: &dyn HostCallbacks) {
    let Some(rendezvous) = segment.rendezvous.as_ref() else {
        // No rendezvous socket: nothing to accept from. This state is
        // only reachable through the non-authoritative path, which
        // always allocates one.
        return;
    };

    match rendezvous.accept_nonblocking() {
        Ok(None) => {}
        Ok(Some(fd)) => {
            log::trace!("segment {}: accepted client, entering VERIFYING", segment.key);
            match ClientSocket::from_accepted(fd) {
                Ok(client) => {
                    segment.client_socket = Some(client);
                    rendezvous.unlink();
                    segment.state = SegmentState::Verifying;
                    segment.incoming_offset = 0;
                    // "Fall through to VERIFYING/POLL in the same tick."
                    poll_verifying(segment, host);
                }
                Err(e) => {
                    log::warn!("segment {}: failed to prepare accepted socket: {e}", segment.key);
                    segment.state = SegmentState::Dead;
                }
            }
        }
        Err(e) => {
            log::warn!("segment {}: rendezvous socket error: {e}", segment.key);
            segment.state = SegmentState::Dead;
        }
    }
}

fn poll_verifying(segment: &mut Segment, host: &dyn HostCallbacks) {
    if segment.expected_key.is_none() {
        complete_handshake(segment, host);
        return;
    }

    let Some(client) = segment.client_socket.as_ref() else {
        segment.state = SegmentState::Dead;
        return;
    };

    // One byte per `POLL` tick: the core must never consume more of the
    // stream than the key line, since the same socket becomes the event
    // transport immediately after the trailing LF.
    match client.read_byte() {
        Ok(None) => {}
        Ok(Some(b'\n')) => {
            let matched = {
                let mut padded = [0u8; EXPECTED_KEY_LEN];
                padded[..segment.incoming_offset]
                    .copy_from_slice(&segment.incoming_buffer[..segment.incoming_offset]);
                let expected = segment.expected_key.as_ref().expect("checked above");
                constant_time_eq(&padded, expected)
            };
            if matched {
                complete_handshake(segment, host);
            } else {
                log::warn!("segment {}: handshake key mismatch", segment.key);
                global_metrics().inc_handshake_failure();
                segment.state = SegmentState::Dead;
            }
        }
        Ok(Some(byte)) => {
            if segment.incoming_offset >= EXPECTED_KEY_LEN {
                log::warn!("segment {}: handshake line exceeded key limit", segment.key);
                global_metrics().inc_handshake_failure();
                segment.state = SegmentState::Dead;
                return;
            }
            segment.incoming_buffer[segment.incoming_offset] = byte;
            segment.incoming_offset += 1;
        }
        Err(e) => {
            log::warn!("segment {}: handshake read failed: {e}", segment.key);
            global_metrics().inc_handshake_failure();
            segment.state = SegmentState::Dead;
        }
    }
}

/// Constant-time equality: XOR-accumulate every byte pair so the compare
/// takes time independent of the position of the first mismatch. An
/// early-return compare would leak prefix length via timing to a local
/// attacker racing connects.
pub fn constant_time_eq(a: &[u8; EXPECTED_KEY_LEN], b: &[u8; EXPECTED_KEY_LEN]) -> bool {
    let mut diff = 0u8;
    for i in 0..EXPECTED_KEY_LEN {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

fn complete_handshake(segment: &mut Segment, host: &dyn HostCallbacks) {
    let Some(client) = segment.client_socket.as_ref() else {
        segment.state = SegmentState::Dead;
        return;
    };

    match send_key(client, &segment.key) {
        Ok(true) => {
            segment.state = SegmentState::Live;
            host.register_emptyframe(segment.key.as_str());
            host.attach_audio_feed(segment.key.as_str());
            global_metrics().inc_handshake_success();
            log::debug!("segment {}: handshake complete, LIVE", segment.key);
        }
        Ok(false) => {
            log::warn!("segment {}: send-key exhausted retries", segment.key);
            global_metrics().inc_handshake_failure();
            segment.state = SegmentState::Dead;
        }
        Err(e) => {
            log::warn!("segment {}: send-key failed: {e}", segment.key);
            global_metrics().inc_handshake_failure();
            segment.state = SegmentState::Dead;
        }
    }
}

fn send_key(client: &ClientSocket, key: &SegmentKey) -> Result<bool> {
    let mut msg = [0u8; KEY_LEN + 1];
    msg[..KEY_LEN].copy_from_slice(key.as_bytes());
    msg[KEY_LEN] = b'\n';
    client.write_all_retrying(&msg)
}

/// Thin facade kept for API symmetry with the other components'
/// `*Allocator`/`*Spawner`-shaped entry points; the free functions above
/// do the actual work and are what the unit tests exercise directly.
pub struct StateMachine;

impl StateMachine {
    pub fn drive(segment: &mut Segment, host: &dyn HostCallbacks, cmd: Command) {
        drive(segment, host, cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingHost;
    use crate::key::KeyNamespace;
    use crate::segment::SegmentAllocator;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    struct FakeNamespace;
    impl KeyNamespace for FakeNamespace {
        fn exists(&self, _shm_name: &str) -> bool {
            false
        }
    }

    fn accepted_pair(segment: &mut Segment) -> UnixStream {
        let (host_side, client_side) = UnixStream::pair().unwrap();
        use std::os::unix::io::IntoRawFd;
        let fd = host_side.into_raw_fd();
        segment.client_socket = Some(ClientSocket::from_accepted(fd).unwrap());
        segment.state = SegmentState::Verifying;
        client_side
    }

    #[test]
    fn no_expected_key_sends_key_immediately() {
        let allocator = SegmentAllocator::new(&FakeNamespace);
        let mut segment = allocator.allocate(None, 0, 0).unwrap();
        let mut client = accepted_pair(&mut segment);
        let host = RecordingHost::new();

        drive(&mut segment, &host, Command::Poll);

        assert_eq!(segment.state, SegmentState::Live);
        let mut buf = vec![0u8; KEY_LEN + 1];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..KEY_LEN], segment.key.as_bytes());
        assert_eq!(buf[KEY_LEN], b'\n');

        segment.client_socket = None;
        allocator.release(segment);
    }

    #[test]
    fn matching_preshared_key_reaches_live() {
        let allocator = SegmentAllocator::new(&FakeNamespace);
        let mut segment = allocator.allocate(None, 0, 0).unwrap();
        segment.expected_key = Some([0x41u8; EXPECTED_KEY_LEN]);
        let mut client = accepted_pair(&mut segment);
        let host = RecordingHost::new();

        let mut line = vec![0x41u8; EXPECTED_KEY_LEN];
        line.push(b'\n');
        client.write_all(&line).unwrap();

        for byte in line {
            drive(&mut segment, &host, Command::Poll);
            let _ = byte;
            if segment.state != SegmentState::Verifying {
                break;
            }
        }

        assert_eq!(segment.state, SegmentState::Live);
        segment.client_socket = None;
        allocator.release(segment);
    }

    #[test]
    fn mismatched_preshared_key_goes_dead_without_sending_key() {
        let allocator = SegmentAllocator::new(&FakeNamespace);
        let mut segment = allocator.allocate(None, 0, 0).unwrap();
        segment.expected_key = Some([0x41u8; EXPECTED_KEY_LEN]);
        let mut client = accepted_pair(&mut segment);
        let host = RecordingHost::new();

        let mut line = vec![0x41u8; EXPECTED_KEY_LEN - 1];
        line.push(0x42);
        line.push(b'\n');
        client.write_all(&line).unwrap();

        for _ in 0..line.len() {
            drive(&mut segment, &host, Command::Poll);
            if segment.state != SegmentState::Verifying {
                break;
            }
        }

        assert_eq!(segment.state, SegmentState::Dead);
        // No key should have been sent: reading should see EOF/empty,
        // never the 32+1 byte key line.
        client.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        segment.client_socket = None;
        allocator.release(segment);
    }

    #[test]
    fn destroy_releases_from_any_state() {
        let allocator = SegmentAllocator::new(&FakeNamespace);
        let mut segment = allocator.allocate(None, 0, 0).unwrap();
        let host = RecordingHost::new();
        drive(&mut segment, &host, Command::Destroy);
        assert_eq!(segment.state, SegmentState::Dead);
        allocator.release(segment);
    }

    #[test]
    fn constant_time_eq_rejects_on_any_difference() {
        let a = [1u8; EXPECTED_KEY_LEN];
        let mut b = a;
        b[0] = 2;
        assert!(!constant_time_eq(&a, &b));
        assert!(constant_time_eq(&a, &a));
    }
}
