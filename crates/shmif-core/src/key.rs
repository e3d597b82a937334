// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Segment key generation and the derived shared-memory / semaphore names.
//!
//! A key, once assigned to a segment, never changes. The three semaphore
//! names are the key with its last byte replaced by `v`, `a`, `e`. To make
//! that safe in general we enforce at generation time that the key is
//! exactly [`KEY_LEN`] bytes and ends in an alphabetic character, rather
//! than assuming it.

use crate::error::{Result, ShmifError};
use std::fmt;

/// Length of a generated segment key, in bytes. Matches the 32-byte key
/// the client receives over the rendezvous socket.
pub const KEY_LEN: usize = 32;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A segment's immutable, printable key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey([u8; KEY_LEN]);

impl SegmentKey {
    /// Wrap an existing byte buffer as a key, validating shape.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Result<Self> {
        if !bytes[KEY_LEN - 1].is_ascii_alphabetic() {
            return Err(ShmifError::BadArgument(
                "segment key must end in an alphabetic byte".into(),
            ));
        }
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ShmifError::BadArgument(
                "segment key must be printable alphanumeric ASCII".into(),
            ));
        }
        Ok(Self(bytes))
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: constructed only from ASCII alphanumeric bytes.
        std::str::from_utf8(&self.0).expect("segment key is always valid ascii")
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derive a semaphore name by replacing the key's last byte with
    /// `suffix` (`v`, `a`, or `e`).
    pub fn semaphore_name(&self, suffix: u8) -> String {
        debug_assert!(matches!(suffix, b'v' | b'a' | b'e'));
        let mut buf = self.0;
        buf[KEY_LEN - 1] = suffix;
        // SAFETY: same ASCII-alphanumeric-or-suffix guarantee as `self.0`.
        String::from_utf8(buf.to_vec()).expect("semaphore name is always valid ascii")
    }

    /// POSIX shared-memory object name: a leading `/` plus the key, as
    /// `shm_open(3)` requires.
    pub fn shm_name(&self) -> String {
        format!("/{}", self.as_str())
    }

    /// POSIX named-semaphore object name for one of the three roles.
    pub fn posix_semaphore_name(&self, suffix: u8) -> String {
        format!("/{}", self.semaphore_name(suffix))
    }

    /// A stable `u64` derived from the key's first 8 bytes (never the
    /// mutable last byte), used to correlate a `NEWSEGMENT` event with
    /// the subsegment it announces without embedding the full key in a
    /// fixed-size event record.
    pub fn correlation_id(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }
}

impl fmt::Debug for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentKey({})", self.as_str())
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Abstracts over "does a shared-memory object with this name already
/// exist" so key generation can be probed against the real `/dev/shm`
/// namespace in production and a fake, in-memory one in tests.
pub trait KeyNamespace {
    fn exists(&self, shm_name: &str) -> bool;
}

/// The real namespace: probes `/dev/shm/<name>` (Linux's backing for
/// POSIX shared memory objects).
pub struct SystemNamespace;

impl KeyNamespace for SystemNamespace {
    fn exists(&self, shm_name: &str) -> bool {
        let trimmed = shm_name.trim_start_matches('/');
        std::path::Path::new("/dev/shm").join(trimmed).exists()
    }
}

/// Upper bound on collision-probe attempts before allocation gives up,
/// so key generation is a total function rather than looping forever
/// against a saturated namespace.
pub const MAX_KEY_ATTEMPTS: usize = 64;

/// Generate a collision-free key by probing `namespace`, seeding the
/// candidate bytes from `entropy` (one `u64` per attempt; the caller
/// supplies entropy so the core never reaches for a global RNG).
pub fn generate_key(
    namespace: &dyn KeyNamespace,
    mut entropy: impl FnMut() -> u64,
) -> Result<SegmentKey> {
    for _ in 0..MAX_KEY_ATTEMPTS {
        let candidate = candidate_from_entropy(entropy());
        let key = SegmentKey::from_bytes(candidate)?;
        if !namespace.exists(&key.shm_name()) {
            return Ok(key);
        }
    }
    Err(ShmifError::KeyExhausted)
}

fn candidate_from_entropy(mut seed: u64) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    for slot in out.iter_mut() {
        // xorshift64* — cheap, deterministic given the seed, good enough
        // distribution for a namespace probe (not a cryptographic key).
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        *slot = ALPHABET[(seed as usize) % ALPHABET.len()];
    }
    // Force the last byte alphabetic so the key is always safe to derive
    // semaphore names from.
    let last_idx = (seed as usize >> 8) % 26;
    out[KEY_LEN - 1] = ALPHABET[last_idx];
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeNamespace {
        taken: std::collections::HashSet<String>,
    }

    impl KeyNamespace for FakeNamespace {
        fn exists(&self, shm_name: &str) -> bool {
            self.taken.contains(shm_name)
        }
    }

    #[test]
    fn semaphore_names_replace_last_byte_only() {
        let key = generate_key(&FakeNamespace { taken: Default::default() }, {
            let mut n = 1u64;
            move || {
                n = n.wrapping_add(0x9E3779B97F4A7C15);
                n
            }
        })
        .unwrap();
        for (suffix, role) in [(b'v', "video"), (b'a', "audio"), (b'e', "event")] {
            let name = key.semaphore_name(suffix);
            assert_eq!(name.len(), KEY_LEN, "role {role}");
            assert_eq!(name.as_bytes()[KEY_LEN - 1], suffix, "role {role}");
            assert_eq!(&name.as_bytes()[..KEY_LEN - 1], &key.as_bytes()[..KEY_LEN - 1]);
        }
    }

    #[test]
    fn rejects_non_alphabetic_last_byte() {
        let mut bytes = [b'a'; KEY_LEN];
        bytes[KEY_LEN - 1] = b'5';
        assert!(SegmentKey::from_bytes(bytes).is_err());
    }

    #[test]
    fn generation_fails_when_namespace_is_saturated() {
        struct AlwaysTaken;
        impl KeyNamespace for AlwaysTaken {
            fn exists(&self, _shm_name: &str) -> bool {
                true
            }
        }
        let mut n = 1u64;
        let result = generate_key(&AlwaysTaken, move || {
            n = n.wrapping_add(1);
            n
        });
        assert!(matches!(result, Err(ShmifError::KeyExhausted)));
    }
}
