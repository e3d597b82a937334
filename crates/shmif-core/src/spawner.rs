// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The child spawner: forks and execs a trusted frameserver binary.
//!
//! Authoritative children are trusted and do not negotiate — the segment
//! they are handed starts `LIVE` rather than going through the
//! [`crate::state_machine`] handshake that non-authoritative peers must
//! complete.

use crate::error::{Result, ShmifError};
use crate::host::HostCallbacks;
use crate::metrics::global_metrics;
use crate::segment::{Segment, SegmentAllocator, SegmentState};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

/// An explicit path plus argument and environment vectors to exec in the
/// forked child (the "external" spawn form). The "builtin" form is
/// resolved to this by [`spawn_builtin`] before the fork happens, since
/// resolving a mode name through the host is a lookup, not something
/// the child can do for itself post-fork.
pub struct SpawnSetup {
    pub path: std::path::PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Distinctive exit status a child process uses when `exec` itself fails
/// after `fork`, so a supervisor can tell "exec failed" apart from a
/// normal exit.
pub const EXEC_FAILURE_STATUS: i32 = 70;

/// Fork, set up the inherited control socket, and exec the target binary
/// described by `setup`. On success, the returned [`Segment`] is `LIVE`
/// and owns a child PID the caller should eventually hand to
/// [`crate::nanny::schedule`] on teardown.
pub fn spawn(
    allocator: &SegmentAllocator<'_>,
    host: &dyn HostCallbacks,
    setup: SpawnSetup,
) -> Result<Segment> {
    let mut segment = allocator.allocate(None, 0, 0)?;

    let (parent_sock, child_sock) = UnixDatagram::pair()?;
    // SAFETY: both descriptors were just created by `UnixDatagram::pair`
    // and are valid for the `fcntl` calls below.
    set_cloexec(parent_sock.as_raw_fd(), true)?;
    set_cloexec(child_sock.as_raw_fd(), false)?;

    let child_fd = child_sock.as_raw_fd();
    let applpath = host.resolve_applpath();

    // SAFETY: `fork` is always safe to call; the two branches below only
    // touch per-process state (fds, environment) that is valid in each.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(ShmifError::ResourceExhausted(std::io::Error::last_os_error()));
    }

    if pid == 0 {
        // Child. `parent_sock` is dropped on this branch's unwind path by
        // virtue of falling out of scope only via `exec`/`exit`, neither
        // of which runs Rust destructors — close it explicitly first.
        drop(parent_sock);
        child_process(child_fd, &applpath, &setup);
        // `child_process` never returns.
    }

    // Parent.
    drop(child_sock);
    segment.child = crate::segment::ChildHandle::Pid(pid);
    segment.state = SegmentState::Live;
    segment.control_socket = Some(parent_sock);

    host.register_emptyframe(segment.key.as_str());
    host.post_configure_spawn(segment.key.as_str());
    global_metrics().inc_children_spawned();

    Ok(segment)
}

fn set_cloexec(fd: RawFd, enabled: bool) -> Result<()> {
    // SAFETY: `fd` is a valid, open descriptor owned by the caller for the
    // duration of this call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(ShmifError::ResourceExhausted(std::io::Error::last_os_error()));
    }
    let new_flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    // SAFETY: see above.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) };
    if ret < 0 {
        return Err(ShmifError::ResourceExhausted(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Runs entirely in the forked child. Never returns: either `execvp`
/// succeeds (replacing this process image) or the child exits with
/// [`EXEC_FAILURE_STATUS`].
fn child_process(sockin_fd: RawFd, applpath: &str, setup: &SpawnSetup) -> ! {
    // Mask SIGINT so an interactive debugger attached to the parent does
    // not reap this child.
    // SAFETY: installing `SIG_IGN` for a signal number is always valid.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }

    set_env("ARCAN_SOCKIN_FD", &sockin_fd.to_string());
    set_env("ARCAN_APPLPATH", applpath);
    for (key, value) in &setup.env {
        set_env(key, value);
    }

    exec(&setup.path, &setup.args);
}

fn set_env(key: &str, value: &str) {
    // SAFETY: called before any additional threads exist in the forked
    // child (fork only replicates the calling thread), so mutating the
    // environment here cannot race another thread's `getenv`.
    unsafe {
        std::env::set_var(key, value);
    }
}

fn exec(path: &std::path::Path, args: &[String]) -> ! {
    let Some(path_str) = path.to_str() else {
        std::process::exit(EXEC_FAILURE_STATUS);
    };
    let Ok(c_path) = CString::new(path_str) else {
        std::process::exit(EXEC_FAILURE_STATUS);
    };
    let mut c_args: Vec<CString> = Vec::with_capacity(args.len() + 1);
    c_args.push(c_path.clone());
    for arg in args {
        match CString::new(arg.as_str()) {
            Ok(c) => c_args.push(c),
            Err(_) => std::process::exit(EXEC_FAILURE_STATUS),
        }
    }
    let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|c| c.as_ptr()).collect();
    argv.push(std::ptr::null());

    // SAFETY: `c_path` and every entry of `argv` are valid NUL-terminated
    // strings kept alive by `c_args`/`c_path` through the call; `argv` is
    // NULL-terminated as `execv` requires.
    unsafe {
        libc::execv(c_path.as_ptr(), argv.as_ptr());
    }
    // Only reached if `execv` failed.
    std::process::exit(EXEC_FAILURE_STATUS);
}

/// Resolve a builtin mode through the host and spawn it, setting the
/// builtin-specific environment (`ARCAN_ARG`; builtins do not receive
/// `ARCAN_SHMKEY`/`ARCAN_SHMSIZE`, those are the external form's province).
pub fn spawn_builtin(
    allocator: &SegmentAllocator<'_>,
    host: &dyn HostCallbacks,
    mode: &str,
    resource: &str,
) -> Result<Segment> {
    let Some(bin_path) = host.resolve_builtin(mode) else {
        return Err(ShmifError::BadArgument(format!("unknown builtin mode: {mode}")));
    };
    let bin_path_str = bin_path
        .to_str()
        .ok_or_else(|| ShmifError::BadArgument("builtin path is not valid UTF-8".into()))?
        .to_string();
    spawn(
        allocator,
        host,
        SpawnSetup {
            path: bin_path,
            args: Vec::new(),
            env: vec![
                ("ARCAN_ARG".to_string(), resource.to_string()),
                ("__ARCAN_BUILTIN_MODE".to_string(), mode.to_string()),
            ],
        },
    )
    .map(|segment| {
        log::debug!("spawned builtin '{mode}' as {bin_path_str}");
        segment
    })
}

/// Resolve an external spawn's shared-memory environment (`ARCAN_SHMKEY`,
/// `ARCAN_SHMSIZE`) from the already-allocated segment, then spawn.
/// Exposed separately from [`spawn`] because those two variables depend
/// on the segment this same call is about to allocate.
pub fn spawn_external(
    allocator: &SegmentAllocator<'_>,
    host: &dyn HostCallbacks,
    path: std::path::PathBuf,
    args: Vec<String>,
    mut env: Vec<(String, String)>,
    resource: &str,
) -> Result<Segment> {
    // `ARCAN_SHMKEY`/`ARCAN_SHMSIZE` cannot be known until the segment
    // exists, so `spawn` is specialized here: allocate first, inject the
    // two variables, then run the common fork/exec path by constructing
    // an equivalent `SpawnSetup::External` and delegating.
    let probe = allocator.allocate(None, 0, 0)?;
    env.push(("ARCAN_SHMKEY".to_string(), probe.key.to_string()));
    env.push(("ARCAN_SHMSIZE".to_string(), probe.size().to_string()));
    env.push(("ARCAN_ARG".to_string(), resource.to_string()));
    allocator.release(probe);

    spawn(allocator, host, SpawnSetup { path, args, env })
}

/// Wrap an already-owned descriptor as a [`UnixDatagram`] for the socket
/// passed to the child. Used by tests that need to construct a control
/// socket without going through [`spawn`]'s fork.
///
/// # Safety
/// `fd` must be a valid, open, exclusively-owned `SOCK_DGRAM` descriptor.
pub unsafe fn datagram_from_raw_fd(fd: RawFd) -> UnixDatagram {
    unsafe { UnixDatagram::from_raw_fd(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyNamespace;

    struct FakeNamespace;
    impl KeyNamespace for FakeNamespace {
        fn exists(&self, _shm_name: &str) -> bool {
            false
        }
    }

    #[test]
    fn spawn_external_runs_true_and_reaches_live() {
        let allocator = SegmentAllocator::new(&FakeNamespace);
        let host = crate::host::RecordingHost::new();
        let segment = spawn(
            &allocator,
            &host,
            SpawnSetup {
                path: std::path::PathBuf::from("/bin/true"),
                args: Vec::new(),
                env: Vec::new(),
            },
        )
        .unwrap();

        assert_eq!(segment.state, SegmentState::Live);
        let pid = match segment.child {
            crate::segment::ChildHandle::Pid(pid) => pid,
            crate::segment::ChildHandle::External => panic!("expected authoritative child"),
        };

        let mut status = 0;
        // SAFETY: reaping our own freshly spawned child.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(ret, pid);

        let calls = host.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("register_emptyframe")));
        assert!(calls.iter().any(|c| c.starts_with("post_configure_spawn")));

        allocator.release(segment);
    }

    #[test]
    fn spawn_builtin_rejects_unknown_mode() {
        let allocator = SegmentAllocator::new(&FakeNamespace);
        let host = crate::host::RecordingHost::new();
        let err = spawn_builtin(&allocator, &host, "not-a-real-mode", "resource").unwrap_err();
        assert!(matches!(err, ShmifError::BadArgument(_)));
    }
}
