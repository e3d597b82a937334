// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error taxonomy for the frameserver control core.
//!
//! Bad argument, resource exhaustion, protocol violation, child death,
//! fatal. The core never panics or unwinds across the host callback
//! boundary — every fallible operation returns [`ShmifError`].

use std::fmt;
use std::io;

/// Errors produced by segment allocation, the connection state machine, the
/// child spawner, the nanny, and the subsegment broker.
#[derive(Debug)]
pub enum ShmifError {
    /// Null handle, zero descriptor, or a malformed key. No resources were
    /// allocated.
    BadArgument(String),

    /// Socket, mmap, truncate, or fork failure. Any partial allocation has
    /// already been unwound by the caller before this is returned.
    ResourceExhausted(io::Error),

    /// Key mismatch, oversize handshake line, or bad page cookie. The
    /// segment has already transitioned to `DEAD`.
    ProtocolViolation(String),

    /// The key namespace could not produce a collision-free key within the
    /// retry bound.
    KeyExhausted,

    /// The rendezvous socket path did not fit the platform's `AF_UNIX`
    /// path limit.
    PathTooLong { len: usize, max: usize },

    /// `page->cookie` did not match the host's build-time cookie.
    CookieMismatch { expected: u64, found: u64 },
}

impl fmt::Display for ShmifError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArgument(msg) => write!(f, "bad argument: {msg}"),
            Self::ResourceExhausted(e) => write!(f, "resource exhausted: {e}"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::KeyExhausted => write!(f, "key namespace exhausted"),
            Self::PathTooLong { len, max } => {
                write!(f, "rendezvous path too long: {len} bytes (max {max})")
            }
            Self::CookieMismatch { expected, found } => {
                write!(f, "page cookie mismatch: expected {expected:#x}, found {found:#x}")
            }
        }
    }
}

impl std::error::Error for ShmifError {}

impl From<io::Error> for ShmifError {
    fn from(e: io::Error) -> Self {
        Self::ResourceExhausted(e)
    }
}

pub type Result<T> = std::result::Result<T, ShmifError>;
