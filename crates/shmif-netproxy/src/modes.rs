// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The four proxy modes and the bridge that runs once authentication
//! succeeds.
//!
//! The a12 wire protocol's actual video/audio reframing is out of scope
//! here — what this module owns is connection lifecycle:
//! mode dispatch, retry, authentication, and relaying the local
//! segment's control channel against the authenticated TCP stream once
//! both sides are up. The relay itself is a raw byte pump over the
//! segment's control socket, the one channel this crate does own; the
//! real a12 bridge would frame that traffic per its own wire format.

use crate::auth::{fail_authentication, A12Handshake, Role};
use crate::dispatch::{self, DispatchMode, PrivilegeSeparation};
use crate::error::{ProxyError, Result};
use crate::retry::RetryPolicy;
use shmif_core::host::HostCallbacks;
use shmif_core::segment::{Segment, SegmentAllocator, SegmentState};
use shmif_core::spawner::{self, SpawnSetup};
use shmif_core::state_machine::{Command as SegCommand, StateMachine};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixDatagram;
use std::thread;
use std::time::Duration;

/// An external binary to run as the local SHMIF client, named by the
/// `EXEC` mode: a CL variant that spawns a given binary as the local
/// SHMIF client upon successful authentication.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub path: std::path::PathBuf,
    pub args: Vec<String>,
}

/// The four top-level modes, resolved from CLI flags.
pub enum ProxyMode {
    /// `-s connpoint host port`.
    Srv { connpoint: String, remote_host: String, remote_port: u16 },
    /// `-l port [host]`, with an optional `-exec` making this the `EXEC`
    /// variant.
    Cl { listen_port: u16, bind_host: Option<String>, exec: Option<ExecSpec> },
    /// `-S fd host port`.
    SrvInherit { inherited_fd: RawFd, remote_host: String, remote_port: u16 },
}

pub struct RunOptions {
    pub dispatch: DispatchMode,
    pub retry: RetryPolicy,
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const LOCAL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn run(
    mode: ProxyMode,
    opts: RunOptions,
    host: &dyn HostCallbacks,
    auth: &dyn A12Handshake,
    privsep: &dyn PrivilegeSeparation,
) -> Result<()> {
    dispatch::install_signal_policy();
    match mode {
        ProxyMode::Srv { connpoint, remote_host, remote_port } => {
            run_srv(&connpoint, &remote_host, remote_port, &opts.retry, host, auth)
        }
        ProxyMode::Cl { listen_port, bind_host, exec } => {
            run_cl(listen_port, bind_host.as_deref(), exec.as_ref(), &opts, host, auth, privsep)
        }
        ProxyMode::SrvInherit { inherited_fd, remote_host, remote_port } => {
            run_srv_inherit(inherited_fd, &remote_host, remote_port, &opts.retry, host, auth)
        }
    }
}

/// **SRV**: open a local connpoint; for each local client that connects,
/// dial the remote peer, run the a12 client handshake, and bridge.
fn run_srv(
    connpoint: &str,
    remote_host: &str,
    remote_port: u16,
    retry: &RetryPolicy,
    host: &dyn HostCallbacks,
    auth: &dyn A12Handshake,
) -> Result<()> {
    let allocator = SegmentAllocator::with_system_namespace();
    loop {
        let mut segment = allocator.allocate(Some(connpoint), 0, 0)?;
        if !wait_for_local_client(&mut segment, host) {
            allocator.release(segment);
            continue;
        }

        let remote_addr = format!("{remote_host}:{remote_port}");
        // The retry loop aborts early if the local client has died, checked
        // against the segment state this same tick drove to `LIVE` above.
        let client_alive = || segment.state == SegmentState::Live;
        let Some(mut stream) = retry.connect(remote_addr.as_str(), client_alive) else {
            tracing::warn!("giving up on outbound connection to {remote_addr}");
            allocator.release(segment);
            continue;
        };

        match auth.handshake(&mut stream, Role::Client) {
            Ok(true) => {
                let control = segment.control_socket.take();
                allocator.release(segment);
                if let Some(control) = control {
                    bridge(control, stream);
                }
            }
            Ok(false) => {
                tracing::warn!("a12 handshake rejected by remote peer");
                fail_authentication(&stream);
                allocator.release(segment);
            }
            Err(e) => {
                tracing::warn!("a12 handshake I/O error: {e}");
                fail_authentication(&stream);
                allocator.release(segment);
            }
        }
    }
}

/// **SRV_INHERIT**: identical to SRV, but the local SHMIF side is an
/// already-open inherited descriptor rather than a freshly bound
/// connpoint.
fn run_srv_inherit(
    inherited_fd: RawFd,
    remote_host: &str,
    remote_port: u16,
    retry: &RetryPolicy,
    _host: &dyn HostCallbacks,
    auth: &dyn A12Handshake,
) -> Result<()> {
    // SAFETY: `inherited_fd` is a valid, open `SOCK_DGRAM` descriptor
    // handed to this process by an exec'ing shmif-client library, and
    // this call takes sole ownership of it.
    let control = unsafe { spawner::datagram_from_raw_fd(inherited_fd) };

    let remote_addr = format!("{remote_host}:{remote_port}");
    let Some(mut stream) = retry.connect(remote_addr.as_str(), || true) else {
        return Err(ProxyError::HandshakeFailed);
    };

    match auth.handshake(&mut stream, Role::Client) {
        Ok(true) => {
            bridge(control, stream);
            Ok(())
        }
        Ok(false) | Err(_) => {
            fail_authentication(&stream);
            Err(ProxyError::HandshakeFailed)
        }
    }
}

/// **CL** / **EXEC**: accept inbound TCP, authenticate the peer as the
/// a12 server, then bring up the local SHMIF client (an exec'd binary
/// for the `EXEC` variant, otherwise a bare authoritative segment the
/// caller is expected to already have a consumer for).
fn run_cl(
    listen_port: u16,
    bind_host: Option<&str>,
    exec: Option<&ExecSpec>,
    opts: &RunOptions,
    host: &dyn HostCallbacks,
    auth: &dyn A12Handshake,
    privsep: &dyn PrivilegeSeparation,
) -> Result<()> {
    let bind_addr = format!("{}:{listen_port}", bind_host.unwrap_or("0.0.0.0"));
    let listener = TcpListener::bind(&bind_addr)?;
    tracing::info!("listening on {bind_addr}");

    let exec = exec.cloned();
    dispatch::accept_loop(&listener, opts.dispatch, privsep, move |stream| {
        handle_cl_connection(stream, exec.as_ref(), host, auth);
    })?;
    Ok(())
}

/// Authenticate one inbound CL connection and, on success, bring up the
/// local client. Split out from [`run_cl`]'s accept loop so it can be
/// driven directly — both by the real dispatch loop (fork or single) and
/// by tests that want to exercise exactly one connection.
pub fn handle_cl_connection(
    mut stream: TcpStream,
    exec: Option<&ExecSpec>,
    host: &dyn HostCallbacks,
    auth: &dyn A12Handshake,
) {
    match auth.handshake(&mut stream, Role::Server) {
        Ok(true) => {
            if let Some(exec) = exec {
                serve_exec_client(exec, host, stream);
            } else {
                tracing::warn!("CL connection authenticated with no local client configured");
            }
        }
        Ok(false) => {
            tracing::warn!("a12 handshake rejected inbound peer");
            fail_authentication(&stream);
        }
        Err(e) => {
            tracing::warn!("a12 handshake I/O error: {e}");
            fail_authentication(&stream);
        }
    }
}

fn serve_exec_client(exec: &ExecSpec, host: &dyn HostCallbacks, stream: TcpStream) {
    let allocator = SegmentAllocator::with_system_namespace();
    let setup = SpawnSetup { path: exec.path.clone(), args: exec.args.clone(), env: Vec::new() };

    match spawner::spawn(&allocator, host, setup) {
        Ok(mut segment) => {
            let pid = match segment.child {
                shmif_core::segment::ChildHandle::Pid(pid) => Some(pid),
                shmif_core::segment::ChildHandle::External => None,
            };
            let control = segment.control_socket.take();
            allocator.release(segment);
            let Some(control) = control else { return };

            // The control channel is a datagram socket: it never signals
            // EOF on its own when the peer process exits. Watch the
            // child's liveness the same way the nanny does and shut the
            // socket down once it is gone, unblocking the bridge's pump
            // threads.
            if let Some(pid) = pid {
                if let Ok(watch_handle) = control.try_clone() {
                    thread::spawn(move || watch_exec_child(pid, watch_handle));
                }
            }

            bridge(control, stream);
        }
        Err(e) => {
            tracing::error!("failed to spawn local EXEC client: {e}");
        }
    }
}

fn watch_exec_child(pid: i32, control: UnixDatagram) {
    while !shmif_core::nanny::has_exited(pid) {
        thread::sleep(POLL_INTERVAL);
    }
    tracing::debug!("exec'd local client pid {pid} exited, tearing down bridge");
    let _ = control.shutdown(std::net::Shutdown::Both);
}

/// Poll a freshly allocated, non-authoritative segment until a local
/// client completes the handshake (`LIVE`) or the wait times out / the
/// segment dies.
fn wait_for_local_client(segment: &mut Segment, host: &dyn HostCallbacks) -> bool {
    let deadline = std::time::Instant::now() + LOCAL_HANDSHAKE_TIMEOUT;
    while std::time::Instant::now() < deadline {
        StateMachine::drive(segment, host, SegCommand::Poll);
        match segment.state {
            SegmentState::Live => return true,
            SegmentState::Dead => return false,
            _ => thread::sleep(POLL_INTERVAL),
        }
    }
    tracing::warn!("timed out waiting for a local client to connect");
    false
}

/// Relay raw bytes between the segment's control socket and the
/// authenticated TCP stream until either side closes.
fn bridge(control: UnixDatagram, stream: TcpStream) {
    let control_rd = match control.try_clone() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to clone control socket for bridge: {e}");
            return;
        }
    };
    let stream_wr = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to clone stream for bridge: {e}");
            return;
        }
    };

    let to_remote = thread::spawn(move || pump_datagram_to_stream(&control_rd, stream_wr));
    let to_local = thread::spawn(move || pump_stream_to_datagram(stream, &control));

    let _ = to_remote.join();
    let _ = to_local.join();
}

fn pump_datagram_to_stream(control: &UnixDatagram, mut stream: TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        match control.recv(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
    let _ = stream.shutdown(std::net::Shutdown::Write);
}

fn pump_stream_to_datagram(mut stream: TcpStream, control: &UnixDatagram) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if control.send(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
}
