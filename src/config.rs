//! Storage geometry and tuning knobs
//!
//! The config is persisted as `config.json` next to the page file so a
//! database is always reopened with the geometry it was created with.

use std::fs::{self, File};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

pub const DEFAULT_NODE_GROUP_SIZE_LOG2: u32 = 17;
pub const DEFAULT_CSR_LEAF_REGION_SIZE_LOG2: u32 = 10;
pub const DEFAULT_VECTOR_CAPACITY_LOG2: u32 = 11;
pub const DEFAULT_PAGE_SIZE_LOG2: u32 = 12;
pub const DEFAULT_BUFFER_POOL_PAGES: usize = 4096;

pub const PACKED_CSR_DENSITY: f64 = 0.8;
pub const LEAF_LOW_CSR_DENSITY: f64 = 0.1;
pub const LEAF_HIGH_CSR_DENSITY: f64 = 1.0;

const MIN_BUFFER_POOL_PAGES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Rows per node group, as a power of two
    pub node_group_size_log2: u32,
    /// Vertices per level-0 segment of the calibrator tree
    pub csr_leaf_region_size_log2: u32,
    pub vector_capacity_log2: u32,
    pub page_size_log2: u32,
    pub packed_csr_density: f64,
    pub leaf_low_csr_density: f64,
    pub leaf_high_csr_density: f64,
    pub buffer_pool_pages: usize,
    pub enable_compression: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            node_group_size_log2: DEFAULT_NODE_GROUP_SIZE_LOG2,
            csr_leaf_region_size_log2: DEFAULT_CSR_LEAF_REGION_SIZE_LOG2,
            vector_capacity_log2: DEFAULT_VECTOR_CAPACITY_LOG2,
            page_size_log2: DEFAULT_PAGE_SIZE_LOG2,
            packed_csr_density: PACKED_CSR_DENSITY,
            leaf_low_csr_density: LEAF_LOW_CSR_DENSITY,
            leaf_high_csr_density: LEAF_HIGH_CSR_DENSITY,
            buffer_pool_pages: DEFAULT_BUFFER_POOL_PAGES,
            enable_compression: true,
        }
    }
}

impl StorageConfig {
    /// Small geometry used by tests: 1024-row node groups split into 64-vertex segments.
    pub fn small() -> Self {
        Self {
            node_group_size_log2: 10,
            csr_leaf_region_size_log2: 6,
            vector_capacity_log2: 6,
            buffer_pool_pages: 256,
            ..Self::default()
        }
    }

    pub fn node_group_size(&self) -> u64 {
        1u64 << self.node_group_size_log2
    }

    pub fn csr_leaf_region_size(&self) -> u64 {
        1u64 << self.csr_leaf_region_size_log2
    }

    pub fn vector_capacity(&self) -> usize {
        1usize << self.vector_capacity_log2
    }

    /// Rows held by one in-memory chunked node group.
    pub fn chunked_node_group_capacity(&self) -> u64 {
        self.vector_capacity() as u64
    }

    pub fn page_size(&self) -> usize {
        1usize << self.page_size_log2
    }

    pub fn calibrator_tree_height(&self) -> u32 {
        self.node_group_size_log2 - self.csr_leaf_region_size_log2
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_group_size_log2 > 32 {
            return Err(StorageError::InvalidConfig(format!(
                "node group size 2^{} is too large",
                self.node_group_size_log2
            )));
        }
        if self.csr_leaf_region_size_log2 > self.node_group_size_log2 {
            return Err(StorageError::InvalidConfig(format!(
                "CSR leaf region 2^{} exceeds node group 2^{}",
                self.csr_leaf_region_size_log2, self.node_group_size_log2
            )));
        }
        if self.vector_capacity_log2 > self.node_group_size_log2 {
            return Err(StorageError::InvalidConfig(format!(
                "vector capacity 2^{} exceeds node group 2^{}",
                self.vector_capacity_log2, self.node_group_size_log2
            )));
        }
        if !(9..=16).contains(&self.page_size_log2) {
            return Err(StorageError::InvalidConfig(format!(
                "page size 2^{} outside 512B..64KiB",
                self.page_size_log2
            )));
        }
        let densities_ok = self.leaf_low_csr_density > 0.0
            && self.leaf_low_csr_density < self.packed_csr_density
            && self.packed_csr_density <= self.leaf_high_csr_density
            && self.leaf_high_csr_density <= 1.0;
        if !densities_ok {
            return Err(StorageError::InvalidConfig(format!(
                "CSR densities must satisfy 0 < low ({}) < packed ({}) <= leaf high ({}) <= 1",
                self.leaf_low_csr_density, self.packed_csr_density, self.leaf_high_csr_density
            )));
        }
        if self.buffer_pool_pages < MIN_BUFFER_POOL_PAGES {
            return Err(StorageError::InvalidConfig(format!(
                "buffer pool needs at least {} pages, got {}",
                MIN_BUFFER_POOL_PAGES, self.buffer_pool_pages
            )));
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
