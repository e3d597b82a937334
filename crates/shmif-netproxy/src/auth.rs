// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Authentication seam for the a12 transport.
//!
//! The a12 wire protocol itself — framing, crypto, the real handshake —
//! is specified elsewhere and out of scope here. What this crate owns is
//! the *policy* around it: authenticate before any SHMIF traffic crosses
//! the wire, and on failure shut the TCP socket down half-duplex and
//! free the local client without signalling dead-man-switch.
//!
//! [`A12Handshake`] is the seam an embedding build substitutes the real
//! a12 crate's handshake into; [`MagicPreambleHandshake`] is a minimal
//! stand-in (a fixed magic byte string exchanged in both directions)
//! sufficient to drive the dispatch, retry, and teardown logic this crate
//! does own, end to end.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Which side of the a12 exchange this process is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We initiated the TCP connection (SRV / SRV_INHERIT modes).
    Client,
    /// We accepted the TCP connection (CL / EXEC modes).
    Server,
}

pub trait A12Handshake: Send + Sync {
    /// Perform the handshake over an already-connected stream. `Ok(true)`
    /// means authentication succeeded and SHMIF traffic may now flow;
    /// `Ok(false)` means the peer was reachable but rejected
    /// authentication (bad key, version mismatch).
    fn handshake(&self, stream: &mut TcpStream, role: Role) -> std::io::Result<bool>;
}

const MAGIC_CLIENT_HELLO: &[u8; 8] = b"A12PROX\0";
const MAGIC_SERVER_ACK: &[u8; 8] = b"A12PROX\x01";

/// Stand-in handshake: the client sends a fixed magic preamble, the
/// server echoes a fixed acknowledgement. Neither side derives a session
/// key from this — it is a placeholder for the real a12 handshake this
/// crate does not own, not a security boundary.
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicPreambleHandshake;

impl A12Handshake for MagicPreambleHandshake {
    fn handshake(&self, stream: &mut TcpStream, role: Role) -> std::io::Result<bool> {
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;

        match role {
            Role::Client => {
                stream.write_all(MAGIC_CLIENT_HELLO)?;
                let mut ack = [0u8; 8];
                stream.read_exact(&mut ack)?;
                Ok(&ack == MAGIC_SERVER_ACK)
            }
            Role::Server => {
                let mut hello = [0u8; 8];
                stream.read_exact(&mut hello)?;
                if &hello != MAGIC_CLIENT_HELLO {
                    return Ok(false);
                }
                stream.write_all(MAGIC_SERVER_ACK)?;
                Ok(true)
            }
        }
    }
}

/// Shut the socket down half-duplex and close it without propagating the
/// dead-man-switch clear a live SHMIF teardown would otherwise signal.
pub fn fail_authentication(stream: &TcpStream) {
    let _ = stream.shutdown(std::net::Shutdown::Write);
    tracing::warn!("a12 authentication failed, closing connection");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn magic_preamble_round_trips_on_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            MagicPreambleHandshake.handshake(&mut stream, Role::Server).unwrap()
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let client_ok = MagicPreambleHandshake.handshake(&mut client, Role::Client).unwrap();
        let server_ok = server.join().unwrap();

        assert!(client_ok);
        assert!(server_ok);
    }

    #[test]
    fn mismatched_preamble_fails_server_side() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            MagicPreambleHandshake.handshake(&mut stream, Role::Server).unwrap()
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"garbage!").unwrap();

        let server_ok = server.join().unwrap();
        assert!(!server_ok);
    }
}
