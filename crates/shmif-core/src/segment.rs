// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The segment handle and its allocator.

use crate::error::{Result, ShmifError};
use crate::key::{generate_key, KeyNamespace, SegmentKey, SystemNamespace};
use crate::mapping::ShmMapping;
use crate::page::{
    build_cookie, EventRing, PageHeader, DEFAULT_AUDIO_BUFFER_BYTES, DEFAULT_SEGMENT_DIMENSION,
    MAX_SEGMENT_DIMENSION,
};
use crate::rendezvous::RendezvousSocket;
use crate::semaphore::SegmentSemaphores;
use std::os::unix::net::UnixDatagram;
use std::time::{SystemTime, UNIX_EPOCH};

/// Platform-defined starting size for a freshly allocated segment, sized
/// for a modest video buffer plus the default audio ring and both event
/// rings.
pub const INITIAL_SEGMENT_SIZE: usize = 1 << 20; // 1 MiB

/// Maximum size `resize` will ever grow a segment to; larger requests are
/// refused.
pub const MAX_SEGMENT_SIZE: usize = 256 << 20; // 256 MiB

/// Length of the optional pre-shared handshake secret.
pub const EXPECTED_KEY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Listen,
    Verifying,
    Live,
    Dead,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentFlags {
    /// Does not own the child process.
    pub subsegment: bool,
    pub alive: bool,
    /// Handshake required before the key is disclosed.
    pub socksig: bool,
    /// Host renderer hint (pixel-buffer-object friendly layout).
    pub pbo: bool,
}

/// A segment's owning child, or the sentinel meaning "externally
/// connected, nothing to supervise".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildHandle {
    External,
    Pid(libc::pid_t),
}

/// Which event mask a segment's control channel uses. Subsegments minted
/// by the broker are `External` rather than inheriting their parent's
/// mask. An explicit enum rather than a raw bitmask, since only these
/// two values ever occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventMask {
    #[default]
    Default,
    External,
}

/// One SHMIF instance: the unit this core manages.
pub struct Segment {
    pub key: SegmentKey,
    mapping: ShmMapping,
    pub semaphores: SegmentSemaphores,
    pub rendezvous: Option<RendezvousSocket>,
    pub control_socket: Option<UnixDatagram>,
    pub child: ChildHandle,
    pub state: SegmentState,
    pub flags: SegmentFlags,
    pub expected_key: Option<[u8; EXPECTED_KEY_LEN]>,
    pub(crate) incoming_offset: usize,
    pub(crate) incoming_buffer: [u8; EXPECTED_KEY_LEN],
    /// The accepted, non-blocking peer connection once a client has been
    /// accepted off the rendezvous socket (the `LISTEN` -> `VERIFYING`
    /// transition). Becomes the bidirectional event-queue transport the
    /// instant the handshake's trailing LF is seen.
    pub(crate) client_socket: Option<crate::state_machine::ClientSocket>,
    pub event_mask: EventMask,
}

impl Segment {
    pub fn header(&self) -> &PageHeader {
        // SAFETY: `self.mapping` always holds at least `PageHeader::SIZE`
        // initialized bytes — `PageHeader::init` is called by every
        // constructor path below before a `Segment` is returned.
        unsafe { &*self.mapping.as_ptr().cast::<PageHeader>() }
    }

    pub fn parent_to_child(&self) -> &EventRing {
        let offset = self.header().parent_to_child_offset as usize;
        // SAFETY: offset was computed by `PageHeader::init` to land within
        // the mapping and to be followed by `EventRing::BYTE_SIZE` bytes
        // also inside the mapping.
        unsafe { &*self.mapping.as_ptr().add(offset).cast::<EventRing>() }
    }

    pub fn child_to_parent(&self) -> &EventRing {
        let offset = self.header().child_to_parent_offset as usize;
        // SAFETY: see `parent_to_child`.
        unsafe { &*self.mapping.as_ptr().add(offset).cast::<EventRing>() }
    }

    pub fn size(&self) -> usize {
        self.mapping.size()
    }

    fn resource_names(&self) -> (String, [String; 3]) {
        (
            self.key.shm_name(),
            [
                self.key.posix_semaphore_name(b'v'),
                self.key.posix_semaphore_name(b'a'),
                self.key.posix_semaphore_name(b'e'),
            ],
        )
    }
}

/// Clamp a caller-supplied width/height hint: non-positive or above the
/// platform maximum becomes the default.
pub fn clamp_dimension(value: i32) -> u16 {
    if value <= 0 || value > i32::from(MAX_SEGMENT_DIMENSION) {
        DEFAULT_SEGMENT_DIMENSION
    } else {
        value as u16
    }
}

pub struct SegmentAllocator<'a> {
    namespace: &'a dyn KeyNamespace,
}

impl<'a> SegmentAllocator<'a> {
    pub fn new(namespace: &'a dyn KeyNamespace) -> Self {
        Self { namespace }
    }

    pub fn with_system_namespace() -> SegmentAllocator<'static> {
        SegmentAllocator { namespace: &SystemNamespace }
    }

    /// Allocate a fresh segment. `rendezvous_name`, if given, also binds a
    /// listening rendezvous socket.
    pub fn allocate(
        &self,
        rendezvous_name: Option<&str>,
        width_hint: i32,
        height_hint: i32,
    ) -> Result<Segment> {
        let key = generate_key(self.namespace, entropy_source())?;
        let width = clamp_dimension(width_hint);
        let height = clamp_dimension(height_hint);

        let mapping = ShmMapping::create(&key.shm_name(), INITIAL_SEGMENT_SIZE)?;
        // SAFETY: `mapping` was just created at `INITIAL_SEGMENT_SIZE`
        // bytes, which is large enough for the header plus both event
        // rings at the default/clamped dimensions (checked by
        // construction: audio + two event rings + a modest video buffer
        // all fit well under 1 MiB).
        unsafe {
            PageHeader::init(
                mapping.as_ptr(),
                std::process::id() as libc::pid_t,
                INITIAL_SEGMENT_SIZE as u32,
                width,
                height,
            );
            let header = &*mapping.as_ptr().cast::<PageHeader>();
            EventRing::init(mapping.as_ptr().add(header.parent_to_child_offset as usize));
            EventRing::init(mapping.as_ptr().add(header.child_to_parent_offset as usize));
        }

        let semaphores = SegmentSemaphores::open(&key).map_err(|e| {
            ShmMapping::unlink(&key.shm_name());
            e
        })?;

        let rendezvous = match rendezvous_name {
            Some(name) => {
                let sock = RendezvousSocket::bind(name).map_err(|e| {
                    ShmMapping::unlink(&key.shm_name());
                    crate::semaphore::SegmentSemaphores::unlink_all(&key);
                    e
                })?;
                Some(sock)
            }
            None => None,
        };

        Ok(Segment {
            key,
            mapping,
            semaphores,
            rendezvous,
            control_socket: None,
            child: ChildHandle::External,
            state: SegmentState::Listen,
            flags: SegmentFlags::default(),
            expected_key: None,
            incoming_offset: 0,
            incoming_buffer: [0u8; EXPECTED_KEY_LEN],
            client_socket: None,
            event_mask: EventMask::default(),
        })
    }

    /// Resize a live segment's video dimensions. Returns `false`/an error
    /// (and marks the segment `DEAD`) on failure. Returns `true` without
    /// remapping when the requested size is within 20% of the current
    /// size in either direction (churn damping against near-identical
    /// repeated requests).
    pub fn resize(&self, segment: &mut Segment, width_hint: i32, height_hint: i32) -> Result<bool> {
        let width = clamp_dimension(width_hint);
        let height = clamp_dimension(height_hint);

        let video_bytes = u64::from(width) * u64::from(height) * 4;
        let new_size = PageHeader::SIZE as u64
            + video_bytes
            + u64::from(DEFAULT_AUDIO_BUFFER_BYTES)
            + 2 * EventRing::BYTE_SIZE as u64;

        if new_size > MAX_SEGMENT_SIZE as u64 {
            segment.state = SegmentState::Dead;
            return Ok(false);
        }

        let current = segment.mapping.size() as u64;
        let band_low = 0.8 * current as f64;
        let band_high = 1.2 * current as f64;
        if new_size as f64 >= band_low && new_size as f64 <= band_high {
            return Ok(true);
        }

        match self.remap(segment, new_size as usize, width, height) {
            Ok(()) => Ok(true),
            Err(e) => {
                segment.state = SegmentState::Dead;
                Err(e)
            }
        }
    }

    fn remap(&self, segment: &mut Segment, new_size: usize, width: u16, height: u16) -> Result<()> {
        let parent_pid = segment
            .header()
            .parent_pid
            .load(std::sync::atomic::Ordering::Relaxed);
        let shm_name = segment.key.shm_name();

        // Recreate the backing object at the new size and map it fresh:
        // unmapped, truncated, remapped. `ShmMapping::create`
        // unlinks-then-recreates the POSIX object;
        // the old mapping stays valid (POSIX detaches on unmap, not
        // unlink) until it is replaced below, at which point its `Drop`
        // unmaps it.
        let new_mapping = ShmMapping::create(&shm_name, new_size)?;

        // SAFETY: `new_mapping` is exactly `new_size` bytes, large enough
        // for the header plus both event rings and the recomputed video
        // buffer at `width`x`height` — `new_size` was computed from those
        // same dimensions by the caller.
        unsafe {
            PageHeader::init(new_mapping.as_ptr(), parent_pid, new_size as u32, width, height);
            let header = &*new_mapping.as_ptr().cast::<PageHeader>();
            EventRing::init(new_mapping.as_ptr().add(header.parent_to_child_offset as usize));
            EventRing::init(new_mapping.as_ptr().add(header.child_to_parent_offset as usize));
        }

        segment.mapping = new_mapping;
        Ok(())
    }

    /// Tear down a segment: unmap, unlink the shm name and three
    /// semaphore names, close sockets, unlink the rendezvous path if any.
    pub fn release(&self, segment: Segment) {
        let (shm_name, sem_names) = segment.resource_names();
        if let Some(rendezvous) = &segment.rendezvous {
            rendezvous.unlink();
        }
        drop(segment);
        ShmMapping::unlink(&shm_name);
        for name in sem_names {
            crate::semaphore::Semaphore::unlink(&name);
        }
    }
}

fn entropy_source() -> impl FnMut() -> u64 {
    let mut counter: u64 = {
        let pid = u64::from(std::process::id());
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        pid ^ nanos ^ build_cookie()
    };
    move || {
        counter = counter.wrapping_add(0x9E3779B97F4A7C15);
        counter ^ (counter >> 29)
    }
}
