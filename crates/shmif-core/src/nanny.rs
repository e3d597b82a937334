// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The nanny: a detached, per-child kill-after-grace supervisor.
//!
//! The host's frame loop cannot afford to block on a child, nor maintain a
//! table of live children keyed by pointer — a child may exit between a
//! lookup and the kill. [`schedule`] instead spawns one short-lived
//! worker thread per killed child: it polls `waitpid` once a second and
//! sends an unconditional kill after [`GRACE_CHECKS`] failed checks, then
//! exits. The PID is a liveness *hint*, never an identity to dereference.

use crate::metrics::global_metrics;
use std::thread;
use std::time::Duration;

/// Environment variable that disables the nanny entirely, for debugging
/// under a parent debugger that would otherwise race the kill.
pub const DISABLE_ENV: &str = "ARCAN_DEBUG_NONANNY";

/// Interval between liveness checks.
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Number of failed checks before the nanny gives up waiting and kills.
const GRACE_CHECKS: u32 = 10;

/// Schedule `pid` for supervised termination. Spawns a detached thread;
/// the caller does not join it. A no-op when [`DISABLE_ENV`] is set.
pub fn schedule(pid: libc::pid_t) {
    if std::env::var_os(DISABLE_ENV).is_some() {
        log::debug!("nanny disabled via {DISABLE_ENV}, not scheduling pid {pid}");
        return;
    }

    thread::spawn(move || watch(pid));
}

fn watch(pid: libc::pid_t) {
    for _ in 0..GRACE_CHECKS {
        if has_exited(pid) {
            log::trace!("nanny: pid {pid} exited before grace period elapsed");
            return;
        }
        thread::sleep(CHECK_INTERVAL);
    }

    log::warn!("nanny: pid {pid} still alive after grace period, sending SIGKILL");
    // SAFETY: `kill` with an arbitrary pid and signal is always a valid
    // call; ESRCH (already dead) is expected and ignored — the pid is
    // treated as a liveness hint, never an identity to dereference.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    global_metrics().inc_nanny_kills();
}

/// Non-blocking check of whether `pid` has already terminated. Exposed
/// beyond this module so other components that track a child's liveness
/// without owning a kill-after-grace policy of their own (the network
/// proxy's exec'd local clients) can reuse the same PID-as-hint check
/// rather than re-deriving the `ECHILD` interpretation.
pub fn has_exited(pid: libc::pid_t) -> bool {
    let mut status: libc::c_int = 0;
    // SAFETY: `status` is a valid out-parameter; `WNOHANG` makes this
    // call non-blocking.
    let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if ret == pid {
        return true;
    }
    if ret < 0 {
        // ECHILD: not our child (already reaped, or never was), or the
        // process is gone. Either way, treat as exited.
        let err = std::io::Error::last_os_error();
        return err.raw_os_error() == Some(libc::ECHILD);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn detects_already_exited_child() {
        // SAFETY: a straightforward fork+exit in a test process; the
        // child does nothing but exit immediately.
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            std::process::exit(0);
        }
        // Give the child a moment to exit, then reap it as the test
        // harness (not the nanny) so ECHILD below is what the nanny
        // would see on a second, independent caller.
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        assert!(has_exited(pid));
    }

    #[test]
    fn kills_unresponsive_child_within_grace_plus_one_second() {
        // SAFETY: spawns a child that sleeps far longer than the grace
        // period so the nanny must kill it.
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            unsafe { libc::sleep(120) };
            std::process::exit(0);
        }

        let start = Instant::now();
        schedule(pid);

        let mut status: libc::c_int = 0;
        // SAFETY: reaping the same pid we scheduled; blocks until the
        // nanny's SIGKILL lands or the sleep above finishes (it won't).
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(ret, pid);
        assert!(
            start.elapsed() < Duration::from_secs(15),
            "nanny should kill well within grace period plus one check interval"
        );
    }
}
