//! Relationship storage of one direction of a rel table
//!
//! Edges are bound to the vertex they are read from. In the CSR format each
//! node group keeps a packed list space shared by all of its vertices plus a
//! header of `(start, length)` pairs. The regular format stores at most one
//! edge per vertex, addressed directly by the vertex offset.
//!
//! Committing a CSR node group runs through [`CommitState`]:
//!
//! 1. find the regions whose density bound still holds after the local changes
//! 2. rewrite the header of those regions and persist the changed entries
//! 3. move data inside each region to the slots the new header describes
//! 4. hand every column write to [`Column::prepare_commit_for_chunk`]
//!
//! Level-0 regions absorb insertions into gaps, sliding neighbouring lists
//! when a gap is too small. Higher regions are rebuilt densely with the free
//! space spread across their vertices.

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::transaction::Transaction;
use super::column::{Column, ColumnSnapshot};
use super::column_chunk::{fill_sequence, ColumnChunk};
use super::csr::{find_regions, CsrHeaderChunks, CsrHeaderColumns, PackedCsrInfo, PackedCsrRegion};
use super::local::{CsrRelNgInfo, LocalRelNg, LocalRelTableData, RegularRelNgInfo, RelNgInfo};
use super::pager::BufferManager;
use super::vector::{SelectionVector, ValueVector};
use super::{split_offset, ColumnId, NodeGroupIdx, Offset, PhysicalType, RelId, RowIdx, TableId, Value};

/// Every rel column set starts with the rel ids.
pub const REL_ID_COLUMN_ID: ColumnId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelDataFormat {
    /// At most one edge per vertex
    Regular,
    Csr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelDirection {
    Forward,
    Backward,
}

impl RelDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            RelDirection::Forward => "fwd",
            RelDirection::Backward => "bwd",
        }
    }
}

/// Progress of one node group through commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommitState {
    Idle,
    RegionsIdentified,
    HeaderUpdated,
    DataReconciled,
    Persisted,
}

impl CommitState {
    fn advance(&mut self, next: CommitState, node_group_idx: NodeGroupIdx) {
        assert!(
            next > *self,
            "commit of node group {} cannot move from {:?} to {:?}",
            node_group_idx,
            self,
            next
        );
        tracing::trace!(node_group = node_group_idx, from = ?self, to = ?next, "Commit state");
        *self = next;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelTableDataSnapshot {
    pub direction: RelDirection,
    pub format: RelDataFormat,
    pub adj: ColumnSnapshot,
    pub columns: Vec<ColumnSnapshot>,
    pub csr_offset: Option<ColumnSnapshot>,
    pub csr_length: Option<ColumnSnapshot>,
}

/// An edge handed to bulk loading, bound to a vertex of the target node group.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkEdge {
    pub offset_in_group: Offset,
    pub nbr: Offset,
    pub rel_id: RelId,
    pub properties: Vec<Option<Value>>,
}

/// Where the value of a rewritten slot comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SlotSource {
    /// Old list-space position, read from the region snapshot
    Persistent(Offset),
    Local(RowIdx),
    Null,
}

#[derive(Debug, Clone, Copy)]
enum WriteTarget {
    Adj,
    Column(ColumnId),
}

struct ColumnWrite {
    target: WriteTarget,
    dst_offsets: Vec<Offset>,
    chunk: ColumnChunk,
}

/// Old list-space values of a region, starting at list offset `base`.
struct RegionSnapshot {
    base: Offset,
    chunk: ColumnChunk,
}

/// Resumable scan over the edges of one vertex.
#[derive(Debug, Clone)]
pub struct RelDataReadState {
    pub column_ids: Vec<ColumnId>,
    node_offset: Offset,
    header: Option<(NodeGroupIdx, CsrHeaderChunks)>,
    persistent_start: Offset,
    persistent_len: u64,
    pos_in_persistent: u64,
    local_inserts: Vec<(RowIdx, Vec<RowIdx>)>,
    pos_in_local: usize,
}

impl RelDataReadState {
    pub fn new(column_ids: Vec<ColumnId>) -> Self {
        Self {
            column_ids,
            node_offset: 0,
            header: None,
            persistent_start: 0,
            persistent_len: 0,
            pos_in_persistent: 0,
            local_inserts: Vec::new(),
            pos_in_local: 0,
        }
    }

    pub fn node_offset(&self) -> Offset {
        self.node_offset
    }
}

pub struct RelTableData {
    table_id: TableId,
    table_name: String,
    direction: RelDirection,
    format: RelDataFormat,
    config: StorageConfig,
    csr_info: PackedCsrInfo,
    adj_column: Column,
    columns: Vec<Column>,
    csr_header_columns: Option<CsrHeaderColumns>,
}

impl RelTableData {
    pub fn new(
        table_id: TableId,
        table_name: &str,
        direction: RelDirection,
        format: RelDataFormat,
        properties: &[(String, PhysicalType)],
        bm: Arc<BufferManager>,
        config: StorageConfig,
    ) -> Self {
        let prefix = format!("{}_{}", table_name, direction.as_str());
        let max_values = match format {
            RelDataFormat::Regular => Some(config.node_group_size()),
            RelDataFormat::Csr => None,
        };
        let compression = config.enable_compression;
        let adj_column = Column::new(
            format!("{}_adj", prefix),
            PhysicalType::UInt64,
            Arc::clone(&bm),
            max_values,
            compression,
        );
        let columns = std::iter::once(("_id".to_string(), PhysicalType::UInt64))
            .chain(properties.iter().cloned())
            .map(|(name, ty)| Column::new(format!("{}_{}", prefix, name), ty, Arc::clone(&bm), max_values, compression))
            .collect();
        let csr_header_columns = (format == RelDataFormat::Csr)
            .then(|| CsrHeaderColumns::new(&prefix, Arc::clone(&bm), config.node_group_size(), compression));
        Self {
            table_id,
            table_name: table_name.to_string(),
            direction,
            format,
            config,
            csr_info: PackedCsrInfo::from_config(&config),
            adj_column,
            columns,
            csr_header_columns,
        }
    }

    pub fn from_snapshot(
        table_id: TableId,
        table_name: &str,
        snapshot: RelTableDataSnapshot,
        bm: Arc<BufferManager>,
        config: StorageConfig,
    ) -> Result<Self> {
        let max_values = match snapshot.format {
            RelDataFormat::Regular => Some(config.node_group_size()),
            RelDataFormat::Csr => None,
        };
        let compression = config.enable_compression;
        let csr_header_columns = match (snapshot.format, snapshot.csr_offset, snapshot.csr_length) {
            (RelDataFormat::Csr, Some(offset), Some(length)) => Some(CsrHeaderColumns::from_snapshots(
                offset,
                length,
                Arc::clone(&bm),
                config.node_group_size(),
                compression,
            )),
            (RelDataFormat::Csr, _, _) => {
                return Err(StorageError::InvalidFormat(format!(
                    "csr rel table {} ({}) has no header columns",
                    table_name,
                    snapshot.direction.as_str()
                )))
            }
            (RelDataFormat::Regular, _, _) => None,
        };
        Ok(Self {
            table_id,
            table_name: table_name.to_string(),
            direction: snapshot.direction,
            format: snapshot.format,
            config,
            csr_info: PackedCsrInfo::from_config(&config),
            adj_column: Column::from_snapshot(snapshot.adj, Arc::clone(&bm), max_values, compression),
            columns: snapshot
                .columns
                .into_iter()
                .map(|c| Column::from_snapshot(c, Arc::clone(&bm), max_values, compression))
                .collect(),
            csr_header_columns,
        })
    }

    pub fn snapshot(&self) -> RelTableDataSnapshot {
        RelTableDataSnapshot {
            direction: self.direction,
            format: self.format,
            adj: self.adj_column.snapshot(),
            columns: self.columns.iter().map(|c| c.snapshot()).collect(),
            csr_offset: self.csr_header_columns.as_ref().map(|h| h.offset.snapshot()),
            csr_length: self.csr_header_columns.as_ref().map(|h| h.length.snapshot()),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn direction(&self) -> RelDirection {
        self.direction
    }

    pub fn format(&self) -> RelDataFormat {
        self.format
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Types of all columns, rel id first.
    pub fn column_types(&self) -> Vec<PhysicalType> {
        self.columns.iter().map(|c| c.data_type()).collect()
    }

    pub fn num_node_groups(&self) -> u64 {
        let header = self
            .csr_header_columns
            .as_ref()
            .map_or(0, |h| h.length.num_node_groups());
        self.adj_column.num_node_groups().max(header)
    }

    /// Slots of a CSR node group's list space, gaps included.
    pub fn csr_capacity(&self, node_group_idx: NodeGroupIdx) -> u64 {
        self.adj_column.num_values(node_group_idx)
    }

    /// Empty local delta store shaped for this direction.
    pub fn new_local_data(&self) -> LocalRelTableData {
        LocalRelTableData::new(self.format, self.column_types(), self.config.vector_capacity() as u64)
    }

    fn header_columns(&self) -> &CsrHeaderColumns {
        match &self.csr_header_columns {
            Some(columns) => columns,
            None => panic!("rel table {} stores {} edges without a csr header", self.table_name, self.direction.as_str()),
        }
    }

    /// Persisted header of a CSR node group.
    pub fn header(&self, node_group_idx: NodeGroupIdx) -> Result<CsrHeaderChunks> {
        self.header_columns()
            .scan(node_group_idx, self.csr_capacity(node_group_idx))
    }

    fn column_for(&self, target: WriteTarget) -> &Column {
        match target {
            WriteTarget::Adj => &self.adj_column,
            WriteTarget::Column(column_id) => &self.columns[column_id],
        }
    }

    fn local_node_group<'a>(&self, transaction: &'a Transaction, node_group_idx: NodeGroupIdx) -> Option<&'a LocalRelNg> {
        if !transaction.is_write_transaction() {
            return None;
        }
        transaction
            .local_storage()
            .rel_table(self.table_id)?
            .direction(self.direction)
            .get(node_group_idx)
    }

    /// Positions `state` at the first edge of `node_offset`.
    pub fn initialize_read_state(
        &self,
        transaction: &Transaction,
        node_offset: Offset,
        state: &mut RelDataReadState,
    ) -> Result<()> {
        let (node_group_idx, pos) = split_offset(node_offset, self.config.node_group_size_log2);
        state.node_offset = node_offset;
        state.pos_in_persistent = 0;
        state.pos_in_local = 0;

        let (start, len) = match self.format {
            RelDataFormat::Csr => {
                let cached = matches!(&state.header, Some((idx, _)) if *idx == node_group_idx);
                if !cached {
                    state.header = Some((node_group_idx, self.header(node_group_idx)?));
                }
                match &state.header {
                    Some((_, header)) if pos < header.num_nodes() => (header.start(pos), header.length(pos)),
                    _ => (0, 0),
                }
            }
            RelDataFormat::Regular => {
                let stored = pos < self.adj_column.num_values(node_group_idx)
                    && self.adj_column.lookup(node_group_idx, pos)?.is_some();
                if stored {
                    (pos, 1)
                } else {
                    (0, 0)
                }
            }
        };
        state.persistent_start = start;
        state.persistent_len = len;
        state.local_inserts = self
            .local_node_group(transaction, node_group_idx)
            .map(|local| local.info().local_inserts(pos))
            .unwrap_or_default();
        Ok(())
    }

    /// Reads the next batch of edges into `nbrs` and `outs` (one vector per
    /// `state.column_ids`). Returns the batch size, 0 when the vertex is done.
    ///
    /// A write transaction sees its own deltas: deleted edges drop out of the
    /// selection, updated values replace persistent ones, and local inserts
    /// follow the persistent edges.
    pub fn scan(
        &self,
        transaction: &Transaction,
        state: &mut RelDataReadState,
        nbrs: &mut ValueVector,
        outs: &mut [ValueVector],
    ) -> Result<usize> {
        let (node_group_idx, pos) = split_offset(state.node_offset, self.config.node_group_size_log2);
        let local = self.local_node_group(transaction, node_group_idx);
        let batch = nbrs.capacity() as u64;

        if state.pos_in_persistent < state.persistent_len {
            let start = state.persistent_start + state.pos_in_persistent;
            let count = (state.persistent_len - state.pos_in_persistent).min(batch);
            let end = start + count;
            self.adj_column.scan(node_group_idx, start, end, nbrs, 0)?;
            for (out, column_id) in outs.iter_mut().zip(&state.column_ids) {
                self.columns[*column_id].scan(node_group_idx, start, end, out, 0)?;
            }

            let mut sel = SelectionVector::unfiltered(count as usize);
            if let Some(local) = local {
                let info = local.info();
                let rel_ids = self.columns[REL_ID_COLUMN_ID].scan_range(node_group_idx, start, end)?;
                let mut visible = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let rel_id = rel_ids.get_u64(i);
                    if info.hides_persistent(pos, rel_id) {
                        continue;
                    }
                    visible.push(i as usize);
                    for (out, column_id) in outs.iter_mut().zip(&state.column_ids) {
                        if let Some(row) = info.updated_row(*column_id, pos, rel_id) {
                            out.set_value(i as usize, local.column(*column_id).get(row))?;
                        }
                    }
                }
                if visible.len() < count as usize {
                    sel = SelectionVector::Filtered(visible);
                }
            }
            nbrs.sel = sel.clone();
            for out in outs.iter_mut() {
                out.sel = sel.clone();
            }
            state.pos_in_persistent += count;
            return Ok(count as usize);
        }

        let Some(local) = local else {
            return Ok(0);
        };
        let remaining = state.local_inserts.len() - state.pos_in_local;
        if remaining == 0 {
            return Ok(0);
        }
        let count = remaining.min(batch as usize);
        for i in 0..count {
            let (adj_row, rows) = &state.local_inserts[state.pos_in_local + i];
            nbrs.set_value(i, local.adj().get(*adj_row))?;
            for (out, column_id) in outs.iter_mut().zip(&state.column_ids) {
                out.set_value(i, local.column(*column_id).get(rows[*column_id]))?;
            }
        }
        nbrs.sel = SelectionVector::unfiltered(count);
        for out in outs.iter_mut() {
            out.sel = SelectionVector::unfiltered(count);
        }
        state.pos_in_local += count;
        Ok(count)
    }

    /// Whether `node_offset` has an edge with `rel_id` visible to `transaction`.
    pub fn find_rel(&self, transaction: &Transaction, node_offset: Offset, rel_id: RelId) -> Result<bool> {
        let capacity = self.config.vector_capacity();
        let mut state = RelDataReadState::new(vec![REL_ID_COLUMN_ID]);
        self.initialize_read_state(transaction, node_offset, &mut state)?;
        let mut nbrs = ValueVector::new(PhysicalType::UInt64, capacity);
        let mut outs = vec![ValueVector::new(PhysicalType::UInt64, capacity)];
        let target = Some(Value::UInt64(rel_id));
        while self.scan(transaction, &mut state, &mut nbrs, &mut outs)? > 0 {
            if outs[0].selected_values().contains(&target) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Merges this direction's local deltas into persistent storage. Node
    /// groups commit independently and in parallel.
    pub fn prepare_commit(&self, transaction: &Transaction) -> Result<CommitState> {
        let Some(local) = transaction
            .local_storage()
            .rel_table(self.table_id)
            .map(|t| t.direction(self.direction))
        else {
            return Ok(CommitState::Idle);
        };
        let node_groups: Vec<(NodeGroupIdx, &LocalRelNg)> = local.node_groups().map(|(idx, ng)| (*idx, ng)).collect();
        let states = node_groups
            .par_iter()
            .map(|(idx, ng)| self.prepare_commit_node_group(transaction, *idx, ng))
            .collect::<Result<Vec<_>>>()?;
        Ok(states.into_iter().max().unwrap_or(CommitState::Idle))
    }

    pub fn prepare_commit_node_group(
        &self,
        transaction: &Transaction,
        node_group_idx: NodeGroupIdx,
        local: &LocalRelNg,
    ) -> Result<CommitState> {
        assert!(
            transaction.is_write_transaction(),
            "commit of rel table {} from read-only transaction {}",
            self.table_name,
            transaction.id()
        );
        match local.info() {
            RelNgInfo::Csr(info) => self.commit_csr_node_group(transaction, node_group_idx, local, info),
            RelNgInfo::Regular(info) => self.commit_regular_node_group(transaction, node_group_idx, local, info),
        }
    }

    fn commit_regular_node_group(
        &self,
        transaction: &Transaction,
        node_group_idx: NodeGroupIdx,
        local: &LocalRelNg,
        info: &RegularRelNgInfo,
    ) -> Result<CommitState> {
        let mut state = CommitState::Idle;
        if info.is_empty() {
            return Ok(state);
        }
        let mut writes = Vec::new();
        // deletes first so a re-insert at the same vertex wins
        let mut adj: BTreeMap<Offset, SlotSource> = info.delete_info().iter().map(|o| (*o, SlotSource::Null)).collect();
        adj.extend(info.adj_insert_info().iter().map(|(o, row)| (*o, SlotSource::Local(*row))));
        writes.extend(self.materialize(WriteTarget::Adj, adj, local, None)?);

        for column_id in 0..self.columns.len() {
            let mut entries: BTreeMap<Offset, SlotSource> =
                info.delete_info().iter().map(|o| (*o, SlotSource::Null)).collect();
            for (offset, row) in info.insert_info(column_id).iter().chain(info.update_info(column_id)) {
                entries.insert(*offset, SlotSource::Local(*row));
            }
            writes.extend(self.materialize(WriteTarget::Column(column_id), entries, local, None)?);
        }
        state.advance(CommitState::DataReconciled, node_group_idx);
        self.apply_writes(transaction, node_group_idx, writes)?;
        state.advance(CommitState::Persisted, node_group_idx);
        Ok(state)
    }

    fn commit_csr_node_group(
        &self,
        transaction: &Transaction,
        node_group_idx: NodeGroupIdx,
        local: &LocalRelNg,
        info: &CsrRelNgInfo,
    ) -> Result<CommitState> {
        let mut state = CommitState::Idle;
        if info.is_empty() {
            return Ok(state);
        }
        let mut old = self.header(node_group_idx)?;
        let persisted_nodes = old.num_nodes();
        let touched = info.touched_offsets();
        let max_touched = touched.iter().next_back().copied().unwrap_or(0);
        old.fill_default_values(persisted_nodes.max(max_touched + 1));

        let num_segments = self.csr_info.num_segments() as usize;
        let mut size_changes = vec![0i64; num_segments];
        let mut has_changes = vec![false; num_segments];
        for offset in &touched {
            let segment = self.csr_info.segment_of(*offset) as usize;
            size_changes[segment] += info.num_insertions(*offset) as i64 - info.num_deletions(*offset) as i64;
            has_changes[segment] = true;
        }
        let regions = find_regions(&old, &size_changes, &has_changes, &self.csr_info);
        state.advance(CommitState::RegionsIdentified, node_group_idx);

        let mut new = old.clone();
        for region in &regions {
            self.update_csr_header(region, &old, &mut new, info);
        }
        assert!(
            new.sanity_check(),
            "csr header of node group {} in {} ({}) is malformed after commit",
            node_group_idx,
            self.table_name,
            self.direction.as_str()
        );
        let changed: Vec<Offset> = (0..new.num_nodes())
            .filter(|n| *n >= persisted_nodes || new.start(*n) != old.start(*n) || new.length(*n) != old.length(*n))
            .collect();
        self.header_columns()
            .prepare_commit(transaction, node_group_idx, &new, &changed)?;
        state.advance(CommitState::HeaderUpdated, node_group_idx);

        let mut writes = Vec::new();
        for region in &regions {
            writes.extend(self.update_region(node_group_idx, region, &old, &new, local, info)?);
        }
        state.advance(CommitState::DataReconciled, node_group_idx);
        self.apply_writes(transaction, node_group_idx, writes)?;
        state.advance(CommitState::Persisted, node_group_idx);

        tracing::debug!(
            table = %self.table_name,
            direction = self.direction.as_str(),
            node_group = node_group_idx,
            regions = regions.len(),
            csr_capacity = new.csr_capacity(),
            "Committed csr node group"
        );
        Ok(state)
    }

    /// Rewrites lengths and starts of `region` in `new`.
    fn update_csr_header(
        &self,
        region: &PackedCsrRegion,
        old: &CsrHeaderChunks,
        new: &mut CsrHeaderChunks,
        info: &CsrRelNgInfo,
    ) {
        let left = region.left_boundary;
        let right = region.right_boundary.min(new.num_nodes() - 1);
        for node in left..=right {
            assert!(
                info.num_deletions(node) <= old.length(node),
                "{} ({}) deletes {} edges of vertex {} which stores {}",
                self.table_name,
                self.direction.as_str(),
                info.num_deletions(node),
                node,
                old.length(node)
            );
        }
        if region.level == 0 {
            // deletions compact in place before insertions look for room
            for node in left..=right {
                new.set_length(node, old.length(node) - info.num_deletions(node));
            }
            find_positions_for_insertions(new, left, right, |node| info.num_insertions(node));
            return;
        }
        for node in left..=right {
            new.set_length(
                node,
                old.length(node) + info.num_insertions(node) - info.num_deletions(node),
            );
        }
        let (start, capacity) = if region.is_global(&self.csr_info) {
            let size = new.region_size(left, right);
            let capacity = old
                .csr_capacity()
                .max((size as f64 / self.csr_info.packed_density).ceil() as u64);
            new.set_csr_capacity(capacity);
            (0, capacity)
        } else {
            (old.start(left), old.region_capacity(left, right))
        };
        distribute_offsets(new, left, right, start, capacity);
    }

    /// Builds the column writes that move `region` from the `old` to the `new` layout.
    fn update_region(
        &self,
        node_group_idx: NodeGroupIdx,
        region: &PackedCsrRegion,
        old: &CsrHeaderChunks,
        new: &CsrHeaderChunks,
        local: &LocalRelNg,
        info: &CsrRelNgInfo,
    ) -> Result<Vec<ColumnWrite>> {
        let left = region.left_boundary;
        let right = region.right_boundary.min(new.num_nodes() - 1);
        let (old_start, old_end) = (old.start(left), old.end(right));
        let rel_ids = self.columns[REL_ID_COLUMN_ID].scan_range(node_group_idx, old_start, old_end)?;

        let targets = std::iter::once(WriteTarget::Adj).chain((0..self.columns.len()).map(WriteTarget::Column));
        let mut writes = Vec::new();
        for target in targets {
            let snapshot = RegionSnapshot {
                base: old_start,
                chunk: self.column_for(target).scan_range(node_group_idx, old_start, old_end)?,
            };
            let write = if region.level == 0 {
                self.update_column(target, left, right, old, new, &rel_ids, &snapshot, local, info)?
            } else {
                self.distribute_and_update_column(target, left, right, old, new, &rel_ids, &snapshot, local, info)?
            };
            writes.extend(write);
        }
        Ok(writes)
    }

    /// Level-0 rewrite: only slots whose content or position changed are written.
    #[allow(clippy::too_many_arguments)]
    fn update_column(
        &self,
        target: WriteTarget,
        left: Offset,
        right: Offset,
        old: &CsrHeaderChunks,
        new: &CsrHeaderChunks,
        rel_ids: &ColumnChunk,
        snapshot: &RegionSnapshot,
        local: &LocalRelNg,
        info: &CsrRelNgInfo,
    ) -> Result<Option<ColumnWrite>> {
        let mut entries = Vec::new();
        for node in left..=right {
            let moved = new.start(node) != old.start(node);
            let resized = info.num_insertions(node) > 0 || info.num_deletions(node) > 0;
            if !moved && !resized {
                if let WriteTarget::Column(column_id) = target {
                    if let Some(rels) = info.update_info(column_id).get(&node) {
                        let (start, end) = (old.start(node), old.start(node) + old.length(node));
                        for (rel_id, row) in rels {
                            let pos = find_csr_offset_in_region(rel_ids, snapshot.base, start, end, *rel_id)
                                .unwrap_or_else(|| {
                                    panic!(
                                        "rel {} is not stored for vertex {} in {} ({})",
                                        rel_id,
                                        node,
                                        self.table_name,
                                        self.direction.as_str()
                                    )
                                });
                            entries.push((pos, SlotSource::Local(*row)));
                        }
                    }
                }
                continue;
            }
            let sources = vertex_sources(target, node, old, rel_ids, snapshot.base, info);
            debug_assert_eq!(sources.len() as u64, new.length(node));
            let new_start = new.start(node);
            for (i, source) in sources.into_iter().enumerate() {
                let dst = new_start + i as u64;
                if source == SlotSource::Persistent(dst) {
                    continue;
                }
                entries.push((dst, source));
            }
        }
        self.materialize(target, entries, local, Some(snapshot))
    }

    /// Rebuilds the whole region densely, gaps as nulls, written in one sequential batch.
    #[allow(clippy::too_many_arguments)]
    fn distribute_and_update_column(
        &self,
        target: WriteTarget,
        left: Offset,
        right: Offset,
        old: &CsrHeaderChunks,
        new: &CsrHeaderChunks,
        rel_ids: &ColumnChunk,
        snapshot: &RegionSnapshot,
        local: &LocalRelNg,
        info: &CsrRelNgInfo,
    ) -> Result<Option<ColumnWrite>> {
        let region_start = new.start(left);
        let capacity = new.end(right) - region_start;
        let mut sources = Vec::with_capacity(capacity as usize);
        for node in left..=right {
            sources.extend(vertex_sources(target, node, old, rel_ids, snapshot.base, info));
            sources.extend(std::iter::repeat(SlotSource::Null).take(new.gap(node) as usize));
        }
        debug_assert_eq!(sources.len() as u64, capacity);
        let entries = fill_sequence(region_start, capacity).into_iter().zip(sources);
        self.materialize(target, entries, local, Some(snapshot))
    }

    fn materialize(
        &self,
        target: WriteTarget,
        entries: impl IntoIterator<Item = (Offset, SlotSource)>,
        local: &LocalRelNg,
        snapshot: Option<&RegionSnapshot>,
    ) -> Result<Option<ColumnWrite>> {
        let entries: Vec<(Offset, SlotSource)> = entries.into_iter().collect();
        if entries.is_empty() {
            return Ok(None);
        }
        let column = self.column_for(target);
        let values = match target {
            WriteTarget::Adj => local.adj(),
            WriteTarget::Column(column_id) => local.column(column_id),
        };
        let mut chunk = ColumnChunk::new(column.data_type(), entries.len() as u64);
        let mut dst_offsets = Vec::with_capacity(entries.len());
        for (dst, source) in entries {
            dst_offsets.push(dst);
            match (source, snapshot) {
                (SlotSource::Null, _) => chunk.append_value(None)?,
                (SlotSource::Local(row), _) => chunk.append_value(values.get(row))?,
                (SlotSource::Persistent(pos), Some(snapshot)) => {
                    chunk.append_chunk(&snapshot.chunk, pos - snapshot.base, 1)?
                }
                (SlotSource::Persistent(_), None) => unreachable!("persistent slot outside a region snapshot"),
            }
        }
        Ok(Some(ColumnWrite {
            target,
            dst_offsets,
            chunk,
        }))
    }

    fn apply_writes(&self, transaction: &Transaction, node_group_idx: NodeGroupIdx, writes: Vec<ColumnWrite>) -> Result<()> {
        for write in writes {
            self.column_for(write.target).prepare_commit_for_chunk(
                transaction,
                node_group_idx,
                &write.dst_offsets,
                &write.chunk,
                0,
            )?;
        }
        Ok(())
    }

    /// Initial write of a node group from bulk-loaded edges. CSR lists are
    /// laid out in input order with packed-density gaps behind each.
    pub fn append_node_group(&self, node_group_idx: NodeGroupIdx, edges: &[BulkEdge]) -> Result<()> {
        let num_nodes = edges.iter().map(|e| e.offset_in_group + 1).max().unwrap_or(0);
        let mut dst_offsets = ColumnChunk::new(PhysicalType::UInt64, edges.len() as u64);
        let (capacity, header) = match self.format {
            RelDataFormat::Csr => {
                let mut lengths = vec![0u64; num_nodes as usize];
                for edge in edges {
                    lengths[edge.offset_in_group as usize] += 1;
                }
                let mut header = CsrHeaderChunks::new(num_nodes);
                let capacity = header.populate_from_lengths(&lengths, self.csr_info.packed_density);
                let mut cursor: Vec<Offset> = (0..num_nodes).map(|n| header.start(n)).collect();
                for edge in edges {
                    let slot = &mut cursor[edge.offset_in_group as usize];
                    dst_offsets.append_value(Some(Value::UInt64(*slot)))?;
                    *slot += 1;
                }
                (capacity, Some(header))
            }
            RelDataFormat::Regular => {
                for edge in edges {
                    dst_offsets.append_value(Some(Value::UInt64(edge.offset_in_group)))?;
                }
                (num_nodes, None)
            }
        };

        // build every source chunk first so a bad value leaves no column half-written
        let nbrs: Vec<Option<Value>> = edges.iter().map(|e| Some(Value::UInt64(e.nbr))).collect();
        let mut sources = vec![(&self.adj_column, ColumnChunk::from_values(PhysicalType::UInt64, &nbrs)?)];
        for (column_id, column) in self.columns.iter().enumerate() {
            let values: Vec<Option<Value>> = edges
                .iter()
                .map(|e| {
                    if column_id == REL_ID_COLUMN_ID {
                        Some(Value::UInt64(e.rel_id))
                    } else {
                        e.properties[column_id - 1]
                    }
                })
                .collect();
            let chunk = ColumnChunk::from_values(column.data_type(), &values).map_err(|e| e.in_column(column.name()))?;
            sources.push((column, chunk));
        }
        for (column, source) in sources {
            let mut chunk = ColumnChunk::new(column.data_type(), capacity);
            chunk.write(&source, &dst_offsets);
            chunk.set_num_values(capacity);
            column.append(&chunk, node_group_idx)?;
        }
        if let Some(header) = header {
            self.header_columns().append(&header, node_group_idx)?;
        }
        tracing::debug!(
            table = %self.table_name,
            direction = self.direction.as_str(),
            node_group = node_group_idx,
            edges = edges.len(),
            "Bulk loaded rel node group"
        );
        Ok(())
    }

    /// Whether the stored header of a CSR node group is well formed.
    pub fn sanity_check(&self, node_group_idx: NodeGroupIdx) -> Result<bool> {
        match self.format {
            RelDataFormat::Regular => Ok(true),
            RelDataFormat::Csr => Ok(self.header(node_group_idx)?.sanity_check()),
        }
    }

    /// `(edges, list-space slots)` of a CSR node group.
    pub fn density(&self, node_group_idx: NodeGroupIdx) -> Result<Option<(u64, u64)>> {
        if self.format == RelDataFormat::Regular {
            return Ok(None);
        }
        let header = self.header(node_group_idx)?;
        let size = (0..header.num_nodes()).map(|n| header.length(n)).sum();
        Ok(Some((size, header.csr_capacity())))
    }
}

/// Old slots of `node` that survive the local deletes, then its local
/// inserts in rel id order. Updated values come from local rows.
fn vertex_sources(
    target: WriteTarget,
    node: Offset,
    old: &CsrHeaderChunks,
    rel_ids: &ColumnChunk,
    base: Offset,
    info: &CsrRelNgInfo,
) -> Vec<SlotSource> {
    let start = old.start(node);
    let mut sources = Vec::new();
    for pos in start..start + old.length(node) {
        let rel_id = rel_ids.get_u64(pos - base);
        if info.is_deleted(node, rel_id) {
            continue;
        }
        let updated = match target {
            WriteTarget::Column(column_id) => info.updated_row(column_id, node, rel_id),
            WriteTarget::Adj => None,
        };
        sources.push(updated.map_or(SlotSource::Persistent(pos), SlotSource::Local));
    }
    let inserts = match target {
        WriteTarget::Adj => info.adj_insert_info().get(&node),
        WriteTarget::Column(column_id) => info.insert_info(column_id).get(&node),
    };
    if let Some(rels) = inserts {
        sources.extend(rels.values().map(|row| SlotSource::Local(*row)));
    }
    sources
}

/// List-space position of `rel_id` within `[start, end)`; `rel_ids` holds the
/// rel id column from list offset `base` on.
pub fn find_csr_offset_in_region(
    rel_ids: &ColumnChunk,
    base: Offset,
    start: Offset,
    end: Offset,
    rel_id: RelId,
) -> Option<Offset> {
    (start..end).find(|pos| rel_ids.get_u64(pos - base) == rel_id)
}

/// Grows the lists of `[left, right]` by their insertion counts, sliding
/// neighbours when a list's own gap is too small. Slides go toward the side
/// with more free slots (right on a tie) and never leave the region.
pub fn find_positions_for_insertions<F>(header: &mut CsrHeaderChunks, left: Offset, right: Offset, num_insertions: F)
where
    F: Fn(Offset) -> u64,
{
    for node in left..=right {
        let inserts = num_insertions(node);
        if inserts == 0 {
            continue;
        }
        let gap = header.gap(node);
        if gap < inserts {
            let needed = inserts - gap;
            let left_gap: u64 = (left..node).map(|n| header.gap(n)).sum();
            let right_gap: u64 = (node + 1..=right).map(|n| header.gap(n)).sum();
            let from_right = if right_gap >= left_gap {
                needed.min(right_gap)
            } else {
                needed - needed.min(left_gap)
            };
            let from_left = needed - from_right;
            assert!(
                from_left <= left_gap && from_right <= right_gap,
                "region [{}, {}] cannot absorb {} insertions at vertex {}",
                left,
                right,
                inserts,
                node
            );
            if from_right > 0 {
                slide_right_for_insertions(header, node, right, from_right);
            }
            if from_left > 0 {
                slide_left_for_insertions(header, node, left, from_left);
            }
        }
        header.set_length(node, header.length(node) + inserts);
    }
}

/// Opens `shift` slots behind `node` by pushing the starts of following
/// vertices right until their gaps absorb the shift.
pub fn slide_right_for_insertions(header: &mut CsrHeaderChunks, node: Offset, right_boundary: Offset, shift: u64) {
    let mut shift = shift;
    let mut next = node + 1;
    while shift > 0 {
        assert!(next <= right_boundary, "slide right past vertex {}", right_boundary);
        let gap = header.gap(next);
        header.set_start(next, header.start(next) + shift);
        shift = shift.saturating_sub(gap);
        next += 1;
    }
}

/// Opens `shift` slots in front of `node` by pulling its start, and those of
/// preceding vertices as needed, to the left.
pub fn slide_left_for_insertions(header: &mut CsrHeaderChunks, node: Offset, left_boundary: Offset, shift: u64) {
    let mut shift = shift;
    let mut current = node;
    while shift > 0 {
        assert!(current > left_boundary, "slide left past vertex {}", left_boundary);
        let gap_before = header.gap(current - 1);
        header.set_start(current, header.start(current) - shift);
        shift = shift.saturating_sub(gap_before);
        current -= 1;
    }
}

/// Lays out `[left, right]` from `start` over `capacity` slots. Each vertex
/// gets free space proportional to its length; the rounding remainder is
/// spread evenly, left-most vertices first.
pub fn distribute_offsets(header: &mut CsrHeaderChunks, left: Offset, right: Offset, start: Offset, capacity: u64) {
    let size = header.region_size(left, right);
    assert!(
        size <= capacity,
        "region [{}, {}] holds {} edges in {} slots",
        left,
        right,
        size,
        capacity
    );
    let gap_space = capacity - size;
    let num_nodes = right - left + 1;
    let mut gaps: Vec<u64> = (left..=right)
        .map(|node| {
            if size == 0 {
                0
            } else {
                (header.length(node) as u128 * gap_space as u128 / size as u128) as u64
            }
        })
        .collect();
    let remainder = gap_space - gaps.iter().sum::<u64>();
    let (each, extra) = (remainder / num_nodes, remainder % num_nodes);
    for (i, gap) in gaps.iter_mut().enumerate() {
        *gap += each + u64::from((i as u64) < extra);
    }
    let mut next = start;
    for (node, gap) in (left..=right).zip(gaps) {
        header.set_start(node, next);
        next += header.length(node) + gap;
    }
    debug_assert_eq!(next, start + capacity);
}
