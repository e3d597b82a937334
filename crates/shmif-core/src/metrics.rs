// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process-wide counters for segment lifecycle and handshake outcomes.
//!
//! Modeled on `transport::shm::metrics::ShmMetrics`: atomic counters with
//! `Relaxed` ordering, a cheap `snapshot()` for reporting, and a
//! process-wide singleton reachable via [`global_metrics`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Segment lifecycle and handshake counters.
///
/// All counters use `Relaxed` ordering; they are eventually consistent
/// across threads, which is all a reporting sweep needs.
#[derive(Debug, Default)]
pub struct ShmifMetrics {
    /// Segments successfully allocated ([`crate::segment::SegmentAllocator::allocate`]).
    pub segments_allocated: AtomicU64,
    /// Segments torn down via [`crate::segment::SegmentAllocator::release`].
    pub segments_released: AtomicU64,
    /// Non-authoritative handshakes that reached `LIVE`.
    pub handshake_success: AtomicU64,
    /// Non-authoritative handshakes that ended in `DEAD` (key mismatch,
    /// oversize line, or socket error).
    pub handshake_failure: AtomicU64,
    /// Authoritative children spawned ([`crate::spawner::spawn`]).
    pub children_spawned: AtomicU64,
    /// Kill signals issued by the nanny after the grace period elapsed.
    pub nanny_kills: AtomicU64,
    /// Subsegments allocated by the broker.
    pub subsegments_allocated: AtomicU64,
}

impl ShmifMetrics {
    pub const fn new() -> Self {
        Self {
            segments_allocated: AtomicU64::new(0),
            segments_released: AtomicU64::new(0),
            handshake_success: AtomicU64::new(0),
            handshake_failure: AtomicU64::new(0),
            children_spawned: AtomicU64::new(0),
            nanny_kills: AtomicU64::new(0),
            subsegments_allocated: AtomicU64::new(0),
        }
    }

    pub fn inc_segments_allocated(&self) {
        self.segments_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_segments_released(&self) {
        self.segments_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handshake_success(&self) {
        self.handshake_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handshake_failure(&self) {
        self.handshake_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_children_spawned(&self) {
        self.children_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_nanny_kills(&self) {
        self.nanny_kills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_subsegments_allocated(&self) {
        self.subsegments_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Non-atomic snapshot for reporting.
    pub fn snapshot(&self) -> ShmifMetricsSnapshot {
        ShmifMetricsSnapshot {
            segments_allocated: self.segments_allocated.load(Ordering::Relaxed),
            segments_released: self.segments_released.load(Ordering::Relaxed),
            handshake_success: self.handshake_success.load(Ordering::Relaxed),
            handshake_failure: self.handshake_failure.load(Ordering::Relaxed),
            children_spawned: self.children_spawned.load(Ordering::Relaxed),
            nanny_kills: self.nanny_kills.load(Ordering::Relaxed),
            subsegments_allocated: self.subsegments_allocated.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ShmifMetrics`], safe to hand to a reporting sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShmifMetricsSnapshot {
    pub segments_allocated: u64,
    pub segments_released: u64,
    pub handshake_success: u64,
    pub handshake_failure: u64,
    pub children_spawned: u64,
    pub nanny_kills: u64,
    pub subsegments_allocated: u64,
}

impl std::fmt::Display for ShmifMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "shmif[alloc={}, released={}, handshake_ok={}, handshake_fail={}, spawned={}, nanny_kills={}, subseg={}]",
            self.segments_allocated,
            self.segments_released,
            self.handshake_success,
            self.handshake_failure,
            self.children_spawned,
            self.nanny_kills,
            self.subsegments_allocated,
        )
    }
}

/// Process-wide metrics instance, following the same `global_metrics()`
/// singleton pattern as `transport::shm::metrics`.
static GLOBAL_METRICS: ShmifMetrics = ShmifMetrics::new();

pub fn global_metrics() -> &'static ShmifMetrics {
    &GLOBAL_METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = ShmifMetrics::new();
        assert_eq!(m.snapshot(), ShmifMetricsSnapshot::default());
    }

    #[test]
    fn increments_are_independent() {
        let m = ShmifMetrics::new();
        m.inc_segments_allocated();
        m.inc_segments_allocated();
        m.inc_handshake_failure();
        let snap = m.snapshot();
        assert_eq!(snap.segments_allocated, 2);
        assert_eq!(snap.handshake_failure, 1);
        assert_eq!(snap.nanny_kills, 0);
    }

    #[test]
    fn display_contains_all_fields() {
        let m = ShmifMetrics::new();
        m.inc_children_spawned();
        let s = m.snapshot().to_string();
        assert!(s.contains("spawned=1"));
    }
}
