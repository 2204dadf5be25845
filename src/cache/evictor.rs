//! Eviction policy: decides which positions leave a layer's host window.
//!
//! Layers are appended in lockstep, so age within a layer is the position
//! index itself. Victims are always the oldest host-resident positions,
//! in ascending order, which keeps spills deterministic.

use std::ops::Range;

use crate::cache::residency::Residency;
use crate::config::EvictionConfig;

/// The eviction policy engine.
pub struct Evictor {
    config: EvictionConfig,
}

impl Evictor {
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    /// Plan the new window base so that `pos` fits in a window of
    /// `capacity` slots starting at or after `base`.
    ///
    /// The window moves at least `spill_batch` positions (clamped to the
    /// capacity) so that a run of appends does not slide it one row at a
    /// time. Returns None when `pos` already fits or `capacity` is zero.
    pub fn plan_slide(&self, base: usize, capacity: usize, pos: usize) -> Option<usize> {
        if capacity == 0 || pos < base + capacity {
            return None;
        }
        let minimal = pos + 1 - capacity;
        let batch = self.config.spill_batch.clamp(1, capacity);
        Some(minimal.max(base + batch).min(pos))
    }

    /// Host-resident positions inside `range`, oldest first.
    pub fn select_victims(&self, meta: &[Residency], range: Range<usize>) -> Vec<usize> {
        let end = range.end.min(meta.len());
        let start = range.start.min(end);
        (start..end).filter(|&p| meta[p].is_host()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::residency::{DiskExtent, DiskTier};

    #[test]
    fn test_victims_oldest_first_host_only() {
        let evictor = Evictor::new(EvictionConfig::default());
        let disk = Residency::Disk(DiskExtent {
            tier: DiskTier::Local,
            offset: 0,
            len: 8,
        });
        let meta = vec![
            Residency::Host,
            disk,
            Residency::Absent,
            Residency::Host,
            Residency::Host,
        ];

        let victims = evictor.select_victims(&meta, 0..4);
        assert_eq!(victims, vec![0, 3]);
    }

    #[test]
    fn test_victims_range_clamped() {
        let evictor = Evictor::new(EvictionConfig::default());
        let meta = vec![Residency::Host; 3];
        assert_eq!(evictor.select_victims(&meta, 1..10), vec![1, 2]);
        assert!(evictor.select_victims(&meta, 5..10).is_empty());
    }

    #[test]
    fn test_plan_slide_batches() {
        let evictor = Evictor::new(EvictionConfig { spill_batch: 8 });

        // Fits: no slide.
        assert_eq!(evictor.plan_slide(0, 32, 31), None);
        // One past the end: slide by the batch.
        assert_eq!(evictor.plan_slide(0, 32, 32), Some(8));
        // Far past the end: slide just enough.
        assert_eq!(evictor.plan_slide(0, 32, 100), Some(69));
        // Batch larger than capacity is clamped so pos stays in the window.
        let big = Evictor::new(EvictionConfig { spill_batch: 1000 });
        assert_eq!(big.plan_slide(0, 4, 4), Some(4));
        assert_eq!(big.plan_slide(0, 0, 4), None);
    }
}
