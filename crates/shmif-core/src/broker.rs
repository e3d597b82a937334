// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The subsegment broker.
//!
//! Multiplexes additional segments onto an existing, already-authenticated
//! connection: a fresh descriptor pair is created, one end is pushed to
//! the child over the parent's control socket, and the new key is
//! announced with a `NEWSEGMENT` event. No rendezvous socket is needed —
//! the transport (the control socket) already exists.

use crate::error::{Result, ShmifError};
use crate::fdpass;
use crate::host::HostCallbacks;
use crate::metrics::global_metrics;
use crate::page::{Event, DEFAULT_SEGMENT_DIMENSION};
use crate::segment::{clamp_dimension, EventMask, Segment, SegmentAllocator, SegmentState};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;

/// One-byte tag attached to the `SCM_RIGHTS` ancillary message, paired
/// with the `FDTRANSFER` event the child observes alongside the raw
/// descriptor.
const FDTRANSFER_TAG: u8 = 0;

/// Parameters for a subsegment request.
pub struct SubsegmentRequest {
    pub width_hint: i32,
    pub height_hint: i32,
    /// Input subsegments skip the audio feed attach.
    pub input: bool,
    /// Caller-supplied correlation tag carried in the `NEWSEGMENT` event.
    pub tag: u64,
}

/// Allocate a subsegment on an already-`LIVE`, authoritative `parent` and
/// hand it to the child over the parent's control socket.
///
/// Returns the new segment handle; the caller is responsible for tracking
/// it exactly like any other segment (it is never nanny-supervised, since
/// it never owns a child process of its own).
pub fn allocate_subsegment(
    allocator: &SegmentAllocator<'_>,
    host: &dyn HostCallbacks,
    parent: &mut Segment,
    request: SubsegmentRequest,
) -> Result<Segment> {
    if parent.state != SegmentState::Live {
        return Err(ShmifError::BadArgument(
            "subsegments can only be requested on a LIVE parent".into(),
        ));
    }
    let Some(parent_control) = parent.control_socket.as_ref() else {
        return Err(ShmifError::BadArgument(
            "parent segment has no control socket to multiplex over".into(),
        ));
    };

    let width = clamp_dimension(request.width_hint);
    let height = clamp_dimension(request.height_hint);

    let mut sub = allocator.allocate(None, i32::from(width), i32::from(height))?;
    sub.child = parent.child;
    sub.flags.subsegment = true;
    sub.event_mask = EventMask::External;
    // The transport already exists and is trusted (it is the parent's
    // own control channel); subsegments do not negotiate.
    sub.state = SegmentState::Live;

    host.create_video_object(sub.key.as_str(), DEFAULT_SEGMENT_DIMENSION, DEFAULT_SEGMENT_DIMENSION);
    if !request.input {
        host.attach_audio_feed(sub.key.as_str());
    }

    if let Err(e) = push_control_socket(parent_control, &mut sub) {
        allocator.release(sub);
        return Err(e);
    }

    let correlation = sub.key.correlation_id();
    parent
        .parent_to_child()
        .push(Event::new_segment(request.tag, correlation));

    global_metrics().inc_subsegments_allocated();
    log::debug!(
        "broker: allocated subsegment {} (tag={}, input={}) for parent {}",
        sub.key,
        request.tag,
        request.input,
        parent.key
    );

    Ok(sub)
}

fn push_control_socket(parent_control: &UnixDatagram, sub: &mut Segment) -> Result<()> {
    let (retained, to_push) = UnixDatagram::pair()?;
    fdpass::send_fd(parent_control, to_push.as_raw_fd(), FDTRANSFER_TAG)?;
    // `to_push`'s descriptor was duplicated into the child's fd table by
    // `SCM_RIGHTS`; this process's copy is no longer needed.
    drop(to_push);
    sub.control_socket = Some(retained);
    Ok(())
}
