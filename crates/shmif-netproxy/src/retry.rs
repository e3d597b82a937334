// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Outbound connection retry policy.
//!
//! A simple linearly-growing sleep: 1s, 2s, ... up to a 10s cap, retried
//! up to `retry_count` attempts, or forever when the count is negative.
//! The loop aborts early if the associated local SHMIF client has died —
//! there is no point reconnecting outbound on behalf of a client that
//! will never consume the result.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// `-r N` / `--retry N`. Negative means retry forever.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_count: i64,
}

impl RetryPolicy {
    pub fn new(retry_count: i64) -> Self {
        Self { retry_count }
    }

    fn is_exhausted(&self, attempts: i64) -> bool {
        self.retry_count >= 0 && attempts >= self.retry_count
    }

    /// Attempt an outbound TCP connection to `addr`, retrying per policy.
    /// `client_alive` is polled before each attempt; once it reports
    /// `false` the loop gives up and returns `None` even if retries
    /// remain.
    pub fn connect<A: ToSocketAddrs, F: FnMut() -> bool>(
        &self,
        addr: A,
        mut client_alive: F,
    ) -> Option<TcpStream> {
        let mut attempts: i64 = 0;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if !client_alive() {
                tracing::debug!("local client died, abandoning outbound retry loop");
                return None;
            }

            match TcpStream::connect(&addr) {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    attempts += 1;
                    tracing::warn!("outbound connect attempt {attempts} failed: {e}");
                    if self.is_exhausted(attempts) {
                        tracing::warn!("retry count exhausted, giving up");
                        return None;
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff + Duration::from_secs(1)).min(MAX_BACKOFF);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_retries_gives_up_after_first_failure() {
        let policy = RetryPolicy::new(0);
        // Port 0 resolved through connect() is refused immediately on
        // loopback, so this exercises the exhaustion path without
        // actually waiting out a backoff.
        let result = policy.connect("127.0.0.1:1", || true);
        assert!(result.is_none());
    }

    #[test]
    fn dead_client_aborts_before_any_attempt() {
        let policy = RetryPolicy::new(-1);
        let mut calls = 0;
        let result = policy.connect("127.0.0.1:1", || {
            calls += 1;
            false
        });
        assert!(result.is_none());
        assert_eq!(calls, 1, "client_alive must be checked before attempting to connect");
    }

    #[test]
    fn successful_connect_returns_stream() {
        use std::net::TcpListener;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let policy = RetryPolicy::new(3);
        let result = policy.connect(addr, || true);
        assert!(result.is_some());
    }
}
