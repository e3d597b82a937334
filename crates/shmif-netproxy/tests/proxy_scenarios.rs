// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end proxy scenario from the reimplementation's test list: the
//! `-l PORT -exec /bin/true` CL/EXEC mode, an inbound connection
//! completing the a12 handshake, the local child being spawned and
//! reaped, and the bridge tearing the socket down cleanly.

use shmif_netproxy::host::NetproxyHost;
use shmif_netproxy::{A12Handshake, ExecSpec, MagicPreambleHandshake, Role};
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::thread;

#[test]
fn exec_mode_spawns_and_reaps_true_then_closes_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _peer) = listener.accept().unwrap();
        let host = NetproxyHost;
        let auth = MagicPreambleHandshake;
        let exec = ExecSpec { path: "/bin/true".into(), args: Vec::new() };
        shmif_netproxy::modes::handle_cl_connection(stream, Some(&exec), &host, &auth);
    });

    let mut client = TcpStream::connect(addr).unwrap();
    let ok = MagicPreambleHandshake.handshake(&mut client, Role::Client).unwrap();
    assert!(ok, "client-side a12 handshake must succeed before any SHMIF traffic");

    // The bridge pumps until the local control channel (held open only
    // by the spawned /bin/true's inherited descriptor, which it never
    // touches and which closes the instant the child exits) yields EOF.
    // /bin/true exits immediately, so this read observes a clean close
    // rather than hanging.
    client.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "bridge must close the remote socket once the local side is gone");

    server.join().unwrap();
}

#[test]
fn failed_handshake_never_spawns_a_child() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _peer) = listener.accept().unwrap();
        let host = NetproxyHost;
        let auth = MagicPreambleHandshake;
        let exec = ExecSpec { path: "/bin/true".into(), args: Vec::new() };
        shmif_netproxy::modes::handle_cl_connection(stream, Some(&exec), &host, &auth);
    });

    let mut client = TcpStream::connect(addr).unwrap();
    use std::io::Write;
    client.write_all(b"not-the-magic").unwrap();

    server.join().unwrap();

    // The server side must have shut its write half down rather than
    // ever sending the ack or any SHMIF traffic.
    client.set_read_timeout(Some(std::time::Duration::from_millis(500))).unwrap();
    let mut buf = [0u8; 8];
    let result = client.read(&mut buf);
    assert!(matches!(result, Ok(0) | Err(_)));
}
