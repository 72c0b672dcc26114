//! Calibrator-tree regions and the density check that picks them

use crate::config::StorageConfig;
use crate::storage::Offset;
use super::header::CsrHeaderChunks;

/// Geometry and density thresholds of the calibrator tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedCsrInfo {
    pub calibrator_tree_height: u32,
    pub leaf_region_size_log2: u32,
    pub node_group_size: u64,
    pub leaf_high_density: f64,
    pub packed_density: f64,
    high_density_step: f64,
}

impl PackedCsrInfo {
    pub fn from_config(config: &StorageConfig) -> Self {
        let height = config.calibrator_tree_height();
        let step = if height == 0 {
            0.0
        } else {
            (config.leaf_high_csr_density - config.packed_csr_density) / height as f64
        };
        Self {
            calibrator_tree_height: height,
            leaf_region_size_log2: config.csr_leaf_region_size_log2,
            node_group_size: config.node_group_size(),
            leaf_high_density: config.leaf_high_csr_density,
            packed_density: config.packed_csr_density,
            high_density_step: step,
        }
    }

    pub fn leaf_region_size(&self) -> u64 {
        1u64 << self.leaf_region_size_log2
    }

    pub fn num_segments(&self) -> u64 {
        self.node_group_size >> self.leaf_region_size_log2
    }

    pub fn segment_of(&self, node: Offset) -> u64 {
        node >> self.leaf_region_size_log2
    }

    /// Highest fill ratio a region at `level` may reach: the leaf bound at
    /// level 0, falling linearly to the packed density at the tree top.
    pub fn high_density(&self, level: u32) -> f64 {
        assert!(
            level <= self.calibrator_tree_height,
            "level {} above calibrator tree height {}",
            level,
            self.calibrator_tree_height
        );
        self.leaf_high_density - self.high_density_step * level as f64
    }
}

/// An aligned span of `2^level` leaf segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedCsrRegion {
    pub region_idx: u64,
    pub level: u32,
    /// Net edge count change of the region's segments
    pub size_change: i64,
    pub left_boundary: Offset,
    pub right_boundary: Offset,
}

impl PackedCsrRegion {
    pub fn new(region_idx: u64, level: u32, info: &PackedCsrInfo) -> Self {
        let left_boundary = (region_idx << level) << info.leaf_region_size_log2;
        let span = info.leaf_region_size() << level;
        let right_boundary = (left_boundary + span - 1).min(info.node_group_size - 1);
        Self {
            region_idx,
            level,
            size_change: 0,
            left_boundary,
            right_boundary,
        }
    }

    /// Index range `[first, last]` of the leaf segments covered.
    pub fn segment_boundaries(&self) -> (u64, u64) {
        let first = self.region_idx << self.level;
        (first, first + (1u64 << self.level) - 1)
    }

    pub fn is_out_of_boundary(&self, node: Offset) -> bool {
        node < self.left_boundary || node > self.right_boundary
    }

    /// True when `other` sits higher in the tree and covers this region.
    pub fn is_within(&self, other: &PackedCsrRegion) -> bool {
        if other.level <= self.level {
            return false;
        }
        let (first, last) = self.segment_boundaries();
        let (other_first, other_last) = other.segment_boundaries();
        other_first <= first && last <= other_last
    }

    pub fn is_global(&self, info: &PackedCsrInfo) -> bool {
        self.level > info.calibrator_tree_height
    }

    /// Copy of the region with `size_change` summed from per-segment changes.
    pub fn with_size_change(mut self, size_changes: &[i64]) -> Self {
        let (first, last) = self.segment_boundaries();
        let last = last.min(size_changes.len() as u64 - 1);
        self.size_change = (first..=last).map(|seg| size_changes[seg as usize]).sum();
        self
    }

    /// Parent region one level up the calibrator tree.
    pub fn upgrade(&self, size_changes: &[i64], info: &PackedCsrInfo) -> Self {
        PackedCsrRegion::new(self.region_idx >> 1, self.level + 1, info).with_size_change(size_changes)
    }
}

/// Whether `region` stays under its level's density bound once its size
/// change is applied. Only vertices present in `header` count.
pub fn is_within_density_bound(header: &CsrHeaderChunks, region: &PackedCsrRegion, info: &PackedCsrInfo) -> bool {
    let num_nodes = header.num_nodes();
    let (old_size, capacity) = if num_nodes == 0 || region.left_boundary >= num_nodes {
        (0, 0)
    } else {
        let right = region.right_boundary.min(num_nodes - 1);
        (
            header.region_size(region.left_boundary, right) as i64,
            header.region_capacity(region.left_boundary, right),
        )
    };
    let new_size = old_size + region.size_change;
    if capacity == 0 {
        return new_size <= 0;
    }
    new_size as f64 / capacity as f64 <= info.high_density(region.level)
}

/// Smallest region containing leaf segment `segment_idx` that satisfies its
/// density bound; the whole-node-group region when no level does.
pub fn find_covering_region(
    segment_idx: u64,
    header: &CsrHeaderChunks,
    size_changes: &[i64],
    info: &PackedCsrInfo,
) -> PackedCsrRegion {
    let leaf = PackedCsrRegion::new(segment_idx, 0, info).with_size_change(size_changes);
    let global = PackedCsrRegion::new(0, info.calibrator_tree_height + 1, info).with_size_change(size_changes);
    std::iter::successors(Some(leaf), |region| {
        (!region.is_global(info)).then(|| region.upgrade(size_changes, info))
    })
    .find(|region| region.is_global(info) || is_within_density_bound(header, region, info))
    .unwrap_or(global)
}

/// Maximal disjoint regions covering every segment flagged in `has_changes`,
/// sorted by left boundary. A single global region replaces everything when
/// any segment needs one.
pub fn find_regions(
    header: &CsrHeaderChunks,
    size_changes: &[i64],
    has_changes: &[bool],
    info: &PackedCsrInfo,
) -> Vec<PackedCsrRegion> {
    let num_segments = has_changes.len() as u64;
    let mut regions: Vec<PackedCsrRegion> = Vec::new();
    let mut segment = 0;
    while segment < num_segments {
        if !has_changes[segment as usize] {
            segment += 1;
            continue;
        }
        let region = find_covering_region(segment, header, size_changes, info);
        if region.is_global(info) {
            return vec![region];
        }
        segment = region.segment_boundaries().1 + 1;
        regions.retain(|r| !r.is_within(&region));
        regions.push(region);
    }
    regions.sort_by_key(|r| r.left_boundary);
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info() -> PackedCsrInfo {
        PackedCsrInfo::from_config(&StorageConfig::small())
    }

    /// Header of `num_nodes` vertices, each with `length` edges in `slots` slots.
    fn uniform_header(num_nodes: u64, length: u64, slots: u64) -> CsrHeaderChunks {
        let mut header = CsrHeaderChunks::new(num_nodes);
        for node in 0..num_nodes {
            header.set_start(node, node * slots);
            header.set_length(node, length);
        }
        header.set_csr_capacity(num_nodes * slots);
        header
    }

    #[test]
    fn test_high_density_interpolates() {
        let info = info();
        assert_eq!(info.calibrator_tree_height, 4);
        assert_eq!(info.high_density(0), 1.0);
        assert!((info.high_density(2) - 0.9).abs() < 1e-9);
        assert!((info.high_density(4) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_region_boundaries() {
        let info = info();
        let leaf = PackedCsrRegion::new(3, 0, &info);
        assert_eq!((leaf.left_boundary, leaf.right_boundary), (192, 255));
        assert_eq!(leaf.segment_boundaries(), (3, 3));

        let parent = leaf.upgrade(&[0; 16], &info);
        assert_eq!(parent.region_idx, 1);
        assert_eq!((parent.left_boundary, parent.right_boundary), (128, 255));
        assert!(leaf.is_within(&parent));
        assert!(!parent.is_within(&leaf));
        assert!(!leaf.is_within(&leaf));
        assert!(parent.is_out_of_boundary(127));

        let global = PackedCsrRegion::new(0, 5, &info);
        assert!(global.is_global(&info));
        assert_eq!((global.left_boundary, global.right_boundary), (0, 1023));
    }

    #[test]
    fn test_density_bound_on_empty_region() {
        let info = info();
        let header = CsrHeaderChunks::new(0);
        let mut region = PackedCsrRegion::new(0, 0, &info);
        assert!(is_within_density_bound(&header, &region, &info));
        region.size_change = 5;
        assert!(!is_within_density_bound(&header, &region, &info));
    }

    #[test]
    fn test_covering_region_upgrades_until_bound_holds() {
        let info = info();
        // 128 vertices, 1 edge in 2 slots each: every segment is half full
        let header = uniform_header(128, 1, 2);
        let mut size_changes = vec![0i64; 16];
        size_changes[0] = 80;

        let region = find_covering_region(0, &header, &size_changes, &info);
        // level 0: (64 + 80) / 128 > 1.0; level 1: (128 + 80) / 256 <= 0.95
        assert_eq!(region.level, 1);
        assert_eq!(region.size_change, 80);
    }

    #[test]
    fn test_covering_region_goes_global_without_capacity() {
        let info = info();
        let header = uniform_header(4, 0, 0);
        let mut size_changes = vec![0i64; 16];
        size_changes[0] = 5;
        let region = find_covering_region(0, &header, &size_changes, &info);
        assert!(region.is_global(&info));
    }

    #[test]
    fn test_find_regions_prunes_nested_candidates() {
        let info = info();
        let header = uniform_header(256, 1, 2);
        let mut size_changes = vec![0i64; 16];
        let mut has_changes = vec![false; 16];
        // segment 0 fits at level 0, segment 1 needs level 1 which covers segment 0
        size_changes[0] = 10;
        has_changes[0] = true;
        size_changes[1] = 90;
        has_changes[1] = true;
        has_changes[3] = true;

        let regions = find_regions(&header, &size_changes, &has_changes, &info);
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].level, regions[0].region_idx), (1, 0));
        assert_eq!(regions[0].size_change, 100);
        assert_eq!((regions[1].level, regions[1].region_idx), (0, 3));
    }

    #[test]
    fn test_find_regions_skips_clean_segments() {
        let info = info();
        let header = uniform_header(256, 1, 2);
        let regions = find_regions(&header, &[0; 16], &[false; 16], &info);
        assert!(regions.is_empty());
    }

    proptest! {
        #[test]
        fn prop_regions_are_disjoint_and_within_bound(
            lengths in proptest::collection::vec(0u64..6, 1..300),
            changes in proptest::collection::vec(-3i64..40, 16),
            dirty in proptest::collection::vec(any::<bool>(), 16),
        ) {
            let info = info();
            let mut header = CsrHeaderChunks::new(0);
            header.populate_from_lengths(&lengths, info.packed_density);
            // deletions never exceed what a segment holds
            let size_changes: Vec<i64> = changes
                .iter()
                .enumerate()
                .map(|(seg, change)| {
                    let first = seg as u64 * info.leaf_region_size();
                    let held: u64 = lengths
                        .iter()
                        .skip(first as usize)
                        .take(info.leaf_region_size() as usize)
                        .sum();
                    (*change).max(-(held as i64))
                })
                .collect();

            let regions = find_regions(&header, &size_changes, &dirty, &info);
            for (i, a) in regions.iter().enumerate() {
                for b in regions.iter().skip(i + 1) {
                    prop_assert!(!a.is_within(b) && !b.is_within(a));
                    prop_assert!(a.right_boundary < b.left_boundary);
                }
                if !a.is_global(&info) {
                    prop_assert!(is_within_density_bound(&header, a, &info));
                }
            }
            for (seg, is_dirty) in dirty.iter().enumerate() {
                if *is_dirty {
                    let node = seg as u64 * info.leaf_region_size();
                    prop_assert!(regions.iter().any(|r| !r.is_out_of_boundary(node)));
                }
            }
        }
    }
}
