//! Frame instrumentation for the culling pipeline.
//!
//! The engine never reports errors from the frame path; callers watch these
//! counters (dropped triangles, bin high-watermark) for quality regressions.
//! Counters are owned by the pipeline and shared with tasks by reference,
//! not global state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe per-frame tallies, updated with relaxed atomics from tasks.
pub struct CullingCounters {
    // Binning
    pub triangles_binned: AtomicU64,
    pub triangles_rejected_backface: AtomicU64,
    pub triangles_rejected_clip: AtomicU64,
    pub triangles_dropped_bin_full: AtomicU64,
    pub bin_high_watermark: AtomicU64,

    // Rasterization
    pub triangles_rasterized: AtomicU64,

    // Occludee tests
    pub occludees_frustum_culled: AtomicU64,
    pub occludees_too_small: AtomicU64,
    pub occludees_occluded: AtomicU64,
    pub occludees_visible: AtomicU64,
    pub depth_tests: AtomicU64,
}

impl CullingCounters {
    pub const fn new() -> Self {
        Self {
            triangles_binned: AtomicU64::new(0),
            triangles_rejected_backface: AtomicU64::new(0),
            triangles_rejected_clip: AtomicU64::new(0),
            triangles_dropped_bin_full: AtomicU64::new(0),
            bin_high_watermark: AtomicU64::new(0),
            triangles_rasterized: AtomicU64::new(0),
            occludees_frustum_culled: AtomicU64::new(0),
            occludees_too_small: AtomicU64::new(0),
            occludees_occluded: AtomicU64::new(0),
            occludees_visible: AtomicU64::new(0),
            depth_tests: AtomicU64::new(0),
        }
    }

    /// Reset all counters to zero (start of frame).
    pub fn reset(&self) {
        self.triangles_binned.store(0, Ordering::Relaxed);
        self.triangles_rejected_backface.store(0, Ordering::Relaxed);
        self.triangles_rejected_clip.store(0, Ordering::Relaxed);
        self.triangles_dropped_bin_full.store(0, Ordering::Relaxed);
        self.bin_high_watermark.store(0, Ordering::Relaxed);
        self.triangles_rasterized.store(0, Ordering::Relaxed);
        self.occludees_frustum_culled.store(0, Ordering::Relaxed);
        self.occludees_too_small.store(0, Ordering::Relaxed);
        self.occludees_occluded.store(0, Ordering::Relaxed);
        self.occludees_visible.store(0, Ordering::Relaxed);
        self.depth_tests.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            triangles_binned: self.triangles_binned.load(Ordering::Relaxed),
            triangles_rejected_backface: self.triangles_rejected_backface.load(Ordering::Relaxed),
            triangles_rejected_clip: self.triangles_rejected_clip.load(Ordering::Relaxed),
            triangles_dropped_bin_full: self.triangles_dropped_bin_full.load(Ordering::Relaxed),
            bin_high_watermark: self.bin_high_watermark.load(Ordering::Relaxed),
            triangles_rasterized: self.triangles_rasterized.load(Ordering::Relaxed),
            occludees_frustum_culled: self.occludees_frustum_culled.load(Ordering::Relaxed),
            occludees_too_small: self.occludees_too_small.load(Ordering::Relaxed),
            occludees_occluded: self.occludees_occluded.load(Ordering::Relaxed),
            occludees_visible: self.occludees_visible.load(Ordering::Relaxed),
            depth_tests: self.depth_tests.load(Ordering::Relaxed),
        }
    }
}

impl Default for CullingCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of counter values at a point in time
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub triangles_binned: u64,
    pub triangles_rejected_backface: u64,
    pub triangles_rejected_clip: u64,
    pub triangles_dropped_bin_full: u64,
    pub bin_high_watermark: u64,
    pub triangles_rasterized: u64,
    pub occludees_frustum_culled: u64,
    pub occludees_too_small: u64,
    pub occludees_occluded: u64,
    pub occludees_visible: u64,
    pub depth_tests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates_and_reset() {
        let counters = CullingCounters::new();
        CullingCounters::bump(&counters.triangles_binned);
        CullingCounters::add(&counters.triangles_binned, 9);
        CullingCounters::bump(&counters.occludees_visible);

        let snap = counters.snapshot();
        assert_eq!(snap.triangles_binned, 10);
        assert_eq!(snap.occludees_visible, 1);

        counters.reset();
        let snap = counters.snapshot();
        assert_eq!(snap.triangles_binned, 0);
        assert_eq!(snap.occludees_visible, 0);
    }
}
