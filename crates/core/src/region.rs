//! Fixed-size region layout of a tracked file

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::hash::{QuickDigest, SlowDigest};

/// Default region size (4 MiB)
pub const REGION_SIZE: u64 = 4 * 1024 * 1024;

/// One contiguous byte range of a file, the unit of change detection and transfer.
///
/// A digest is only evidence of content while its `*_modified` timestamp is
/// at least the file's current mtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Offset of the first byte
    pub offset: u64,
    /// Length in bytes (only the last region of a file may be shorter)
    pub size: u64,
    /// Sampled tail checksum
    pub quick_digest: Option<QuickDigest>,
    /// SHA-256 of the whole range
    pub slow_digest: Option<SlowDigest>,
    /// File mtime observed when `quick_digest` was computed
    pub fast_modified: Option<SystemTime>,
    /// File mtime observed when `slow_digest` was computed
    pub slow_modified: Option<SystemTime>,
}

impl Region {
    /// A region with no digests yet
    #[must_use]
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            quick_digest: None,
            slow_digest: None,
            fast_modified: None,
            slow_modified: None,
        }
    }

    /// Offset one past the last byte
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// True if the quick digest was computed against `mtime` or later
    #[must_use]
    pub fn fast_fresh(&self, mtime: SystemTime) -> bool {
        self.fast_modified.is_some_and(|t| t >= mtime)
    }

    /// True if the slow digest was computed against `mtime` or later
    #[must_use]
    pub fn slow_fresh(&self, mtime: SystemTime) -> bool {
        self.slow_modified.is_some_and(|t| t >= mtime)
    }
}

/// How [`RegionCalculator::calculate`] treats the existing layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    /// Drop every existing region (first sizing of a file)
    Replace,
    /// Keep regions whose offset and size are unchanged, digests included
    Merge,
}

/// Partitions `[0, size)` into regions of `region_size` bytes
#[derive(Debug, Clone, Copy)]
pub struct RegionCalculator {
    region_size: u64,
}

impl Default for RegionCalculator {
    fn default() -> Self {
        Self::new(REGION_SIZE)
    }
}

impl RegionCalculator {
    /// Create a calculator; a zero region size is bumped to one byte
    #[must_use]
    pub fn new(region_size: u64) -> Self {
        Self {
            region_size: region_size.max(1),
        }
    }

    /// Configured region size
    #[must_use]
    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Number of regions a file of `size` bytes has
    #[must_use]
    pub fn region_count(&self, size: u64) -> u64 {
        size.div_ceil(self.region_size)
    }

    /// Iterate the `(offset, size)` layout for a file of `size` bytes
    pub fn layout(&self, size: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        (0..self.region_count(size)).map(move |i| {
            let offset = i * self.region_size;
            (offset, self.region_size.min(size - offset))
        })
    }

    /// Rewrite `regions` to the layout for `size`.
    ///
    /// Returns true if anything changed.
    pub fn calculate(&self, regions: &mut BTreeMap<u64, Region>, size: u64, mode: ChunkMode) -> bool {
        let mut changed = false;

        if mode == ChunkMode::Replace && !regions.is_empty() {
            regions.clear();
            changed = true;
        }

        // Offsets past the end of the file are gone
        let stale = regions.split_off(&size);
        changed |= !stale.is_empty();

        for (offset, len) in self.layout(size) {
            match regions.get(&offset) {
                Some(existing) if existing.size == len => {}
                _ => {
                    regions.insert(offset, Region::new(offset, len));
                    changed = true;
                }
            }
        }

        // A smaller region size in a later call can leave offsets between boundaries
        let before = regions.len();
        let region_size = self.region_size;
        regions.retain(|offset, _| offset % region_size == 0);
        changed |= regions.len() != before;

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets_and_sizes(regions: &BTreeMap<u64, Region>) -> Vec<(u64, u64)> {
        regions.values().map(|r| (r.offset, r.size)).collect()
    }

    #[test]
    fn test_boundary_law() {
        let calc = RegionCalculator::new(4);
        for size in 0..=17u64 {
            let mut regions = BTreeMap::new();
            calc.calculate(&mut regions, size, ChunkMode::Replace);

            let n = size.div_ceil(4);
            assert_eq!(regions.len() as u64, n, "size {size}");
            for (i, region) in regions.values().enumerate() {
                assert_eq!(region.offset, i as u64 * 4);
                if (i as u64) < n - 1 {
                    assert_eq!(region.size, 4);
                } else {
                    assert_eq!(region.size, size - 4 * (n - 1));
                }
            }
        }
    }

    #[test]
    fn test_ten_megabytes_gives_three_regions() {
        let calc = RegionCalculator::default();
        let mut regions = BTreeMap::new();
        calc.calculate(&mut regions, 10 * 1024 * 1024, ChunkMode::Replace);
        assert_eq!(
            offsets_and_sizes(&regions),
            vec![
                (0, REGION_SIZE),
                (REGION_SIZE, REGION_SIZE),
                (2 * REGION_SIZE, 2 * 1024 * 1024)
            ]
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let calc = RegionCalculator::new(10);
        let mut regions = BTreeMap::new();
        assert!(calc.calculate(&mut regions, 35, ChunkMode::Merge));
        let first = regions.clone();
        assert!(!calc.calculate(&mut regions, 35, ChunkMode::Merge));
        assert_eq!(regions, first);
    }

    #[test]
    fn test_merge_keeps_unchanged_digests() {
        let calc = RegionCalculator::new(10);
        let mut regions = BTreeMap::new();
        calc.calculate(&mut regions, 25, ChunkMode::Replace);
        for region in regions.values_mut() {
            region.quick_digest = Some(7);
        }

        // Grow: region at 20 changes size, 0 and 10 keep their digests
        calc.calculate(&mut regions, 38, ChunkMode::Merge);
        assert_eq!(offsets_and_sizes(&regions), vec![(0, 10), (10, 10), (20, 10), (30, 8)]);
        assert_eq!(regions[&0].quick_digest, Some(7));
        assert_eq!(regions[&10].quick_digest, Some(7));
        assert_eq!(regions[&20].quick_digest, None);

        // Shrink: offsets past the end disappear
        calc.calculate(&mut regions, 12, ChunkMode::Merge);
        assert_eq!(offsets_and_sizes(&regions), vec![(0, 10), (10, 2)]);
        assert_eq!(regions[&0].quick_digest, Some(7));
        assert_eq!(regions[&10].quick_digest, None);
    }

    #[test]
    fn test_replace_drops_digests() {
        let calc = RegionCalculator::new(10);
        let mut regions = BTreeMap::new();
        calc.calculate(&mut regions, 20, ChunkMode::Replace);
        regions.get_mut(&0).unwrap().quick_digest = Some(1);

        calc.calculate(&mut regions, 20, ChunkMode::Replace);
        assert_eq!(regions[&0].quick_digest, None);
    }

    #[test]
    fn test_empty_file_has_no_regions() {
        let calc = RegionCalculator::default();
        let mut regions = BTreeMap::new();
        calc.calculate(&mut regions, 0, ChunkMode::Replace);
        assert!(regions.is_empty());
    }

    #[test]
    fn test_freshness_compares_mtime() {
        let t0 = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(100);
        let later = t0 + std::time::Duration::from_secs(1);
        let mut region = Region::new(0, 1);
        assert!(!region.fast_fresh(t0));
        region.fast_modified = Some(t0);
        assert!(region.fast_fresh(t0));
        assert!(!region.fast_fresh(later));
        assert!(!region.slow_fresh(t0));
    }
}
