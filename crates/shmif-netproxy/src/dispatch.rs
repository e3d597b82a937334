// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Connection dispatch strategies.
//!
//! `MT_SINGLE` serves one connection at a time in-process; `MT_FORK`
//! forks per connection. In the forked form the parent closes the
//! connection fd immediately after handoff, the child closes the
//! listening fd and calls the host-provided privilege-separation
//! primitive before running the bridge. Child reaping is implicit: the
//! fork is a terminal step (the child calls `exit` directly, never
//! returning to an event loop that would need to `waitpid`), so the
//! proxy ignores `SIGCHLD` process-wide rather than tracking zombies.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

/// `-t` selects [`DispatchMode::Single`]; the default is
/// [`DispatchMode::Fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Single,
    Fork,
}

/// Host-provided privilege-separation primitive, invoked by a forked
/// child before it runs the bridge. Out of scope to specify further
/// here — sandboxing policy is a deployment concern.
pub trait PrivilegeSeparation: Send + Sync {
    fn drop_privileges(&self) -> io::Result<()>;
}

/// No-op primitive for standalone use or tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrivilegeSeparation;

impl PrivilegeSeparation for NoPrivilegeSeparation {
    fn drop_privileges(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Install the process-wide signal policy this component depends on:
/// ignore `SIGPIPE` (a peer closing its read end must not kill the
/// proxy) and `SIGCHLD` (fork-per-connection children exit directly, no
/// zombie reaping table is kept).
pub fn install_signal_policy() {
    // SAFETY: installing `SIG_IGN` for a fixed, valid signal number is
    // always a sound call.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }
}

/// Accept connections from `listener` forever, dispatching each one to
/// `handler` according to `mode`. Returns only on a fatal accept error.
pub fn accept_loop<F>(
    listener: &TcpListener,
    mode: DispatchMode,
    privsep: &dyn PrivilegeSeparation,
    mut handler: F,
) -> io::Result<()>
where
    F: FnMut(TcpStream),
{
    loop {
        let (stream, peer) = listener.accept()?;
        tracing::debug!("accepted connection from {peer}");

        match mode {
            DispatchMode::Single => handler(stream),
            DispatchMode::Fork => dispatch_fork(listener, stream, privsep, &mut handler)?,
        }
    }
}

fn dispatch_fork<F>(
    listener: &TcpListener,
    stream: TcpStream,
    privsep: &dyn PrivilegeSeparation,
    handler: &mut F,
) -> io::Result<()>
where
    F: FnMut(TcpStream),
{
    // SAFETY: `fork` duplicates this process; the two branches below
    // only touch per-process state (fds, privileges) valid in each.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        // Child: close the listening socket — its own fd-table copy,
        // the parent's is untouched — then drop privileges and run the
        // bridge. This call never returns.
        // SAFETY: `listener.as_raw_fd()` is valid in this (forked)
        // process; closing it here only affects this process's fd
        // table entry.
        unsafe {
            libc::close(listener.as_raw_fd());
        }
        if let Err(e) = privsep.drop_privileges() {
            tracing::error!("privilege separation failed: {e}");
            std::process::exit(1);
        }
        handler(stream);
        std::process::exit(0);
    }

    // Parent: the connection now belongs to the child; close our copy
    // immediately after handoff.
    drop(stream);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream as ClientStream;

    #[test]
    fn fork_dispatch_handles_one_connection_in_child() {
        install_signal_policy();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // SAFETY: simple fork in a test harness whose child exits
        // immediately after serving one connection.
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            let _ = accept_loop(&listener, DispatchMode::Fork, &NoPrivilegeSeparation, |mut s| {
                use std::io::Write;
                let _ = s.write_all(b"ok");
            });
            std::process::exit(0);
        }

        let mut client = ClientStream::connect(addr).unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");

        let mut status = 0;
        unsafe { libc::kill(pid, libc::SIGKILL) };
        unsafe { libc::waitpid(pid, &mut status, 0) };
    }
}
