// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Frameserver control core: shared-memory segment allocation, the
//! non-authoritative connection handshake, authoritative child lifecycle,
//! and subsegment multiplexing for a SHMIF-style multimedia front-end.
//!
//! This crate is the host engine's collaborator, not a standalone
//! program: the rendering engine, audio mixer, scripting VM and resource
//! path resolution stay on the other side of [`host::HostCallbacks`].

pub mod broker;
pub mod error;
pub mod fdpass;
pub mod host;
pub mod key;
pub mod mapping;
pub mod metrics;
pub mod nanny;
pub mod page;
pub mod rendezvous;
pub mod segment;
pub mod semaphore;
pub mod spawner;
pub mod state_machine;

pub use error::{Result, ShmifError};
pub use host::HostCallbacks;
pub use key::SegmentKey;
pub use metrics::{global_metrics, ShmifMetrics, ShmifMetricsSnapshot};
pub use segment::{ChildHandle, Segment, SegmentAllocator, SegmentFlags, SegmentState};
pub use state_machine::{Command, StateMachine};
