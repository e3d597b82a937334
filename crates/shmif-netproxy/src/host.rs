// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The [`shmif_core::HostCallbacks`] implementation this binary runs
//! with. The proxy has no renderer, audio mixer, or scripting VM of its
//! own — these hooks only need to keep `shmif-core`'s spawner and state
//! machine satisfied, not drive real video/audio.

use shmif_core::host::HostCallbacks;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct NetproxyHost;

impl HostCallbacks for NetproxyHost {
    fn resolve_builtin(&self, mode: &str) -> Option<PathBuf> {
        tracing::debug!("proxy does not support builtin frameserver mode '{mode}'");
        None
    }

    fn resolve_applpath(&self) -> String {
        std::env::var("ARCAN_APPLPATH").unwrap_or_default()
    }

    fn register_emptyframe(&self, key: &str) {
        tracing::trace!("segment {key} now LIVE, no local renderer attached");
    }

    fn post_configure_spawn(&self, key: &str) {
        tracing::trace!("segment {key} spawned");
    }

    fn attach_audio_feed(&self, key: &str) {
        tracing::trace!("segment {key} audio feed not mixed locally");
    }

    fn create_video_object(&self, key: &str, width: u16, height: u16) {
        tracing::trace!("segment {key} subsegment video object {width}x{height} (unused)");
    }
}
