// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end connection and allocator scenarios exercising the full
//! rendezvous, handshake, spawn, resize, and subsegment-broker paths
//! together rather than in isolation.

use shmif_core::broker::{allocate_subsegment, SubsegmentRequest};
use shmif_core::host::RecordingHost;
use shmif_core::key::SystemNamespace;
use shmif_core::page::EventKind;
use shmif_core::segment::{ChildHandle, EventMask, SegmentState};
use shmif_core::spawner::{spawn, SpawnSetup};
use shmif_core::state_machine::{drive, Command};
use shmif_core::SegmentAllocator;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

/// `HOME` is read by [`shmif_core::rendezvous::resolve_path`]; serialize
/// the tests that touch it so they don't race each other's `env::set_var`.
static HOME_LOCK: Mutex<()> = Mutex::new(());

fn with_tmp_home<T>(f: impl FnOnce() -> T) -> T {
    let _guard = HOME_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let original = std::env::var_os("HOME");
    // SAFETY: single-threaded with respect to HOME via `HOME_LOCK`.
    unsafe { std::env::set_var("HOME", dir.path()) };
    std::fs::create_dir_all(dir.path().join(".shmif")).unwrap();
    let result = f();
    match original {
        // SAFETY: see above.
        Some(home) => unsafe { std::env::set_var("HOME", home) },
        None => unsafe { std::env::remove_var("HOME") },
    }
    result
}

fn drive_until<F: Fn(SegmentState) -> bool>(
    segment: &mut shmif_core::Segment,
    host: &dyn shmif_core::HostCallbacks,
    done: F,
    max_ticks: usize,
) {
    for _ in 0..max_ticks {
        if done(segment.state) {
            return;
        }
        drive(segment, host, Command::Poll);
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    panic!("state machine did not reach the expected state within {max_ticks} ticks");
}

/// Allocate with rendezvous `"test1"`, connect a local client, send
/// `"k\n"` while expected key is empty -> client receives the 32-byte
/// segment key followed by LF; segment transitions to LIVE.
#[test]
fn empty_expected_key_sends_segment_key_and_goes_live() {
    with_tmp_home(|| {
        let allocator = SegmentAllocator::new(&SystemNamespace);
        let host = RecordingHost::new();
        let mut segment = allocator.allocate(Some("test1"), 0, 0).unwrap();
        let path = segment.rendezvous.as_ref().unwrap().path().to_string();

        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(b"k\n").unwrap();

        drive_until(&mut segment, &host, |s| s == SegmentState::Live, 200);

        let mut response = vec![0u8; 33];
        client.read_exact(&mut response).unwrap();
        assert_eq!(&response[..32], segment.key.as_bytes());
        assert_eq!(response[32], b'\n');

        allocator.release(segment);
    });
}

/// Allocate with rendezvous `"test2"`, pre-load expected key = 64
/// bytes all `0x41`. Client sends 63x`0x41` + `0x42` + `\n` -> connection
/// released, no key sent, segment DEAD.
#[test]
fn mismatched_preshared_key_goes_dead_without_sending_key() {
    with_tmp_home(|| {
        let allocator = SegmentAllocator::new(&SystemNamespace);
        let host = RecordingHost::new();
        let mut segment = allocator.allocate(Some("test2"), 0, 0).unwrap();
        segment.expected_key = Some([0x41u8; 64]);
        let path = segment.rendezvous.as_ref().unwrap().path().to_string();

        let mut client = UnixStream::connect(&path).unwrap();
        let mut line = vec![0x41u8; 63];
        line.push(0x42);
        line.push(b'\n');
        client.write_all(&line).unwrap();

        drive_until(&mut segment, &host, |s| s == SegmentState::Dead, 200);

        client.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)), "no key byte should ever arrive");

        allocator.release(segment);
    });
}

/// Spawn with the external form, with a stand-in binary (a shell
/// script) in place of a real builtin frameserver, and confirm the child
/// observed `ARCAN_SHMKEY` equal to the segment's key and that the page
/// cookie matches the host's build cookie.
#[test]
fn spawned_child_observes_shmkey_and_matching_cookie() {
    let allocator = SegmentAllocator::new(&SystemNamespace);
    let host = RecordingHost::new();

    let out_dir = tempfile::tempdir().unwrap();
    let out_path = out_dir.path().join("observed_shmkey");
    let script_path = out_dir.path().join("fake_decoder.sh");
    std::fs::write(
        &script_path,
        format!("#!/bin/sh\nprintf '%s' \"$ARCAN_SHMKEY\" > {}\n", out_path.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script_path, std::os::unix::fs::PermissionsExt::from_mode(0o755))
        .unwrap();

    let segment = shmif_core::spawner::spawn_external(
        &allocator,
        &host,
        script_path,
        Vec::new(),
        Vec::new(),
        "file.mkv",
    )
    .unwrap();

    assert_eq!(segment.state, SegmentState::Live);
    assert_eq!(segment.header().cookie, shmif_core::page::build_cookie());

    let pid = match segment.child {
        ChildHandle::Pid(pid) => pid,
        ChildHandle::External => panic!("expected an authoritative child"),
    };
    let mut status = 0;
    // SAFETY: reaping our own freshly spawned child.
    unsafe { libc::waitpid(pid, &mut status, 0) };

    let observed = std::fs::read_to_string(&out_path).unwrap();
    assert_eq!(observed, segment.key.to_string());

    allocator.release(segment);
}

/// Allocated segment, issue `resize(1920, 1080)` then `resize(1919,
/// 1081)` -> second call is a no-op (returns true, size unchanged) even
/// though the second pair is a hair larger in raw pixel count.
#[test]
fn near_identical_resize_is_idempotent() {
    let allocator = SegmentAllocator::new(&SystemNamespace);
    let mut segment = allocator.allocate(None, 1920, 1080).unwrap();
    assert!(allocator.resize(&mut segment, 1920, 1080).unwrap());
    let size_after_first = segment.size();

    assert!(allocator.resize(&mut segment, 1919, 1081).unwrap());
    assert_eq!(segment.size(), size_after_first, "second resize must be a no-op");

    allocator.release(segment);
}

/// Create parent segment, request subsegment with `input=false`, hint
/// 64x48, tag=7 -> new segment with `subsegment=true`, a `NEWSEGMENT`
/// event present in the parent's outqueue naming the subsegment's key,
/// and a descriptor visible on the parent's control channel.
#[test]
fn subsegment_broker_announces_new_segment() {
    let allocator = SegmentAllocator::new(&SystemNamespace);
    let host = RecordingHost::new();
    let mut parent = spawn(
        &allocator,
        &host,
        SpawnSetup { path: std::path::PathBuf::from("/bin/true"), args: Vec::new(), env: Vec::new() },
    )
    .unwrap();

    let sub = allocate_subsegment(
        &allocator,
        &host,
        &mut parent,
        SubsegmentRequest { width_hint: 64, height_hint: 48, input: false, tag: 7 },
    )
    .unwrap();

    assert!(sub.flags.subsegment);
    assert_eq!(sub.event_mask, EventMask::External);

    let event = parent.parent_to_child().pop().expect("NEWSEGMENT event must be enqueued");
    assert_eq!(event.kind(), Some(EventKind::NewSegment));
    assert_eq!(event.tag, 7);
    assert_eq!(event.aux, sub.key.correlation_id());
    assert!(sub.control_socket.is_some(), "subsegment fd must be visible over the control channel");

    let mut status = 0;
    if let ChildHandle::Pid(pid) = parent.child {
        unsafe { libc::waitpid(pid, &mut status, 0) };
    }
    allocator.release(sub);
    allocator.release(parent);
}
