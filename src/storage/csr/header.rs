//! CSR header: per-vertex start offset and list length

use std::sync::Arc;

use crate::error::Result;
use crate::storage::column::{Column, ColumnSnapshot};
use crate::storage::column_chunk::ColumnChunk;
use crate::storage::pager::BufferManager;
use crate::storage::{NodeGroupIdx, Offset, PhysicalType};
use crate::transaction::Transaction;

/// Slack to reserve behind a list of `length` edges so it sits at `density`.
pub fn compute_gap_from_length(length: u64, density: f64) -> u64 {
    ((length as f64 / density).ceil() as u64).saturating_sub(length)
}

/// In-memory copy of one node group's header.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrHeaderChunks {
    pub offset: ColumnChunk,
    pub length: ColumnChunk,
    csr_capacity: u64,
}

impl CsrHeaderChunks {
    pub fn new(capacity: u64) -> Self {
        Self {
            offset: ColumnChunk::new(PhysicalType::UInt64, capacity),
            length: ColumnChunk::new(PhysicalType::UInt64, capacity),
            csr_capacity: 0,
        }
    }

    pub fn from_chunks(offset: ColumnChunk, length: ColumnChunk, csr_capacity: u64) -> Self {
        assert_eq!(
            offset.num_values(),
            length.num_values(),
            "csr offset and length chunks disagree on vertex count"
        );
        Self {
            offset,
            length,
            csr_capacity,
        }
    }

    pub fn num_nodes(&self) -> u64 {
        self.length.num_values()
    }

    /// Total slots of the node group's list space, gaps included.
    pub fn csr_capacity(&self) -> u64 {
        self.csr_capacity
    }

    pub fn set_csr_capacity(&mut self, csr_capacity: u64) {
        self.csr_capacity = csr_capacity;
    }

    pub fn start(&self, node: Offset) -> Offset {
        self.offset.get_u64(node)
    }

    pub fn end(&self, node: Offset) -> Offset {
        if node + 1 < self.num_nodes() {
            self.start(node + 1)
        } else {
            self.csr_capacity
        }
    }

    pub fn length(&self, node: Offset) -> u64 {
        self.length.get_u64(node)
    }

    pub fn gap(&self, node: Offset) -> u64 {
        let (start, end, length) = (self.start(node), self.end(node), self.length(node));
        assert!(
            start + length <= end,
            "csr list of vertex {} overruns its slots: start {} length {} end {}",
            node,
            start,
            length,
            end
        );
        end - start - length
    }

    pub fn set_start(&mut self, node: Offset, start: Offset) {
        self.offset.set_u64(node, start);
    }

    pub fn set_length(&mut self, node: Offset, length: u64) {
        self.length.set_u64(node, length);
    }

    /// Extends the header to `num_nodes` vertices. New vertices own no slots:
    /// they start at the end of the list space with length 0.
    pub fn fill_default_values(&mut self, num_nodes: u64) {
        let current = self.num_nodes();
        if num_nodes <= current {
            return;
        }
        if num_nodes > self.offset.capacity() {
            self.offset.resize(num_nodes);
            self.length.resize(num_nodes);
        }
        for node in current..num_nodes {
            self.set_start(node, self.csr_capacity);
            self.set_length(node, 0);
        }
    }

    /// Checks that every list fits inside its slots and starts are non-decreasing.
    pub fn sanity_check(&self) -> bool {
        let n = self.num_nodes();
        (0..n).all(|node| {
            let start = self.start(node);
            let end = self.end(node);
            start <= end && start + self.length(node) <= end
        }) && (n == 0 || self.end(n - 1) <= self.csr_capacity)
    }

    /// Lays out lists of the given lengths back to back, each followed by the
    /// gap `density` asks for. Returns the resulting list-space capacity.
    pub fn populate_from_lengths(&mut self, lengths: &[u64], density: f64) -> u64 {
        let n = lengths.len() as u64;
        if n > self.offset.capacity() {
            self.offset.resize(n);
            self.length.resize(n);
        }
        let mut next = 0;
        for (node, length) in lengths.iter().enumerate() {
            self.set_start(node as u64, next);
            self.set_length(node as u64, *length);
            next += length + compute_gap_from_length(*length, density);
        }
        self.offset.set_num_values(n);
        self.length.set_num_values(n);
        self.csr_capacity = next;
        next
    }

    /// Sum of list lengths of vertices `[left, right]`.
    pub fn region_size(&self, left: Offset, right: Offset) -> u64 {
        (left..=right).map(|node| self.length(node)).sum()
    }

    /// Slots spanned by vertices `[left, right]`, gaps included.
    pub fn region_capacity(&self, left: Offset, right: Offset) -> u64 {
        self.end(right) - self.start(left)
    }
}

/// Persistent offset and length columns of one relationship direction.
pub struct CsrHeaderColumns {
    pub offset: Column,
    pub length: Column,
}

impl CsrHeaderColumns {
    pub fn new(prefix: &str, bm: Arc<BufferManager>, node_group_size: u64, enable_compression: bool) -> Self {
        Self {
            offset: Column::new(
                format!("{}_csr_offset", prefix),
                PhysicalType::UInt64,
                Arc::clone(&bm),
                Some(node_group_size),
                enable_compression,
            ),
            length: Column::new(
                format!("{}_csr_length", prefix),
                PhysicalType::UInt64,
                bm,
                Some(node_group_size),
                enable_compression,
            ),
        }
    }

    pub fn from_snapshots(
        offset: ColumnSnapshot,
        length: ColumnSnapshot,
        bm: Arc<BufferManager>,
        node_group_size: u64,
        enable_compression: bool,
    ) -> Self {
        Self {
            offset: Column::from_snapshot(offset, Arc::clone(&bm), Some(node_group_size), enable_compression),
            length: Column::from_snapshot(length, bm, Some(node_group_size), enable_compression),
        }
    }

    pub fn num_nodes(&self, node_group_idx: NodeGroupIdx) -> u64 {
        self.length.num_values(node_group_idx)
    }

    /// Loads a node group's header; `csr_capacity` is the size of its list space.
    pub fn scan(&self, node_group_idx: NodeGroupIdx, csr_capacity: u64) -> Result<CsrHeaderChunks> {
        let offset = self.offset.scan_node_group(node_group_idx)?;
        let length = self.length.scan_node_group(node_group_idx)?;
        Ok(CsrHeaderChunks::from_chunks(offset, length, csr_capacity))
    }

    /// Initial write of a bulk-loaded node group's header.
    pub fn append(&self, header: &CsrHeaderChunks, node_group_idx: NodeGroupIdx) -> Result<()> {
        self.offset.append(&header.offset, node_group_idx)?;
        self.length.append(&header.length, node_group_idx)
    }

    /// Persists the header entries of `nodes`.
    pub fn prepare_commit(
        &self,
        transaction: &Transaction,
        node_group_idx: NodeGroupIdx,
        header: &CsrHeaderChunks,
        nodes: &[Offset],
    ) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let mut offsets = ColumnChunk::new(PhysicalType::UInt64, nodes.len() as u64);
        let mut lengths = ColumnChunk::new(PhysicalType::UInt64, nodes.len() as u64);
        for (i, node) in nodes.iter().enumerate() {
            offsets.set_u64(i as u64, header.start(*node));
            lengths.set_u64(i as u64, header.length(*node));
        }
        self.offset
            .prepare_commit_for_chunk(transaction, node_group_idx, nodes, &offsets, 0)?;
        self.length
            .prepare_commit_for_chunk(transaction, node_group_idx, nodes, &lengths, 0)
    }
}
