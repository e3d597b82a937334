// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The seam between this crate and the embedding engine.
//!
//! The rendering engine, audio mixer, scripting VM, and path resolution
//! live outside this crate, referenced only through the interfaces it
//! consumes. The reference design wires those collaborators in by
//! swapping raw function pointers into a segment's frame-callback slot;
//! this crate instead expresses the seam as a trait the embedding engine
//! implements, consumed by the spawner, the connection state machine,
//! and the subsegment broker.

use std::path::PathBuf;

/// Host-engine hooks consumed by [`crate::spawner`], [`crate::state_machine`]
/// and [`crate::broker`]. None of these calls may block the frame loop.
pub trait HostCallbacks {
    /// Resolve a builtin frameserver mode name (e.g. `"decode"`) to an
    /// executable path via the engine's path resolver.
    fn resolve_builtin(&self, mode: &str) -> Option<PathBuf>;

    /// Application-relative resource root passed to the child as
    /// `ARCAN_APPLPATH`.
    fn resolve_applpath(&self) -> String;

    /// Register the placeholder rendering callback (`emptyframe`) for a
    /// freshly spawned or accepted segment.
    fn register_emptyframe(&self, key: &str);

    /// Host-specific post-spawn configuration: device hints, default
    /// input routing.
    fn post_configure_spawn(&self, key: &str);

    /// Attach the audio feed for a segment that has just reached `LIVE`
    /// (never done before `LIVE`).
    fn attach_audio_feed(&self, key: &str);

    /// Allocate an in-host video object for a new subsegment, sized
    /// `width`x`height` (a 32x32 placeholder by default).
    fn create_video_object(&self, key: &str, width: u16, height: u16);
}

/// A [`HostCallbacks`] that records calls instead of driving a real
/// renderer/mixer — used by this crate's own tests and available to
/// embedding engines for integration testing of the core in isolation.
#[derive(Default)]
pub struct RecordingHost {
    pub calls: std::sync::Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl HostCallbacks for RecordingHost {
    fn resolve_builtin(&self, mode: &str) -> Option<PathBuf> {
        self.record(format!("resolve_builtin({mode})"));
        match mode {
            "decode" => Some(PathBuf::from("/usr/libexec/arcan_frameserver_decode")),
            _ => None,
        }
    }

    fn resolve_applpath(&self) -> String {
        self.record("resolve_applpath");
        String::from("/usr/share/arcan/appl")
    }

    fn register_emptyframe(&self, key: &str) {
        self.record(format!("register_emptyframe({key})"));
    }

    fn post_configure_spawn(&self, key: &str) {
        self.record(format!("post_configure_spawn({key})"));
    }

    fn attach_audio_feed(&self, key: &str) {
        self.record(format!("attach_audio_feed({key})"));
    }

    fn create_video_object(&self, key: &str, width: u16, height: u16) {
        self.record(format!("create_video_object({key}, {width}x{height})"));
    }
}
