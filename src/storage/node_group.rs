//! Node groups: fixed-capacity vertical slices of a node table
//!
//! A [`NodeGroup`] is an arena of [`ChunkedNodeGroup`]s. After loading or a
//! checkpoint it holds a single on-disk group; committed appends add
//! in-memory groups of `CHUNKED_NODE_GROUP_CAPACITY` rows behind it. The
//! arena lock is only taken to change its shape or to pick a group; row-level
//! work then runs on that group's own lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::transaction::Transaction;
use super::column::Column;
use super::column_chunk::ColumnChunk;
use super::vector::{SelectionVector, ValueVector};
use super::{ColumnId, NodeGroupIdx, Offset, PhysicalType, RowIdx, Value};

/// Persistent columns backing a node table: one per property plus the deletion flags.
pub struct NodeColumns {
    pub properties: Vec<Column>,
    pub deleted: Column,
}

impl NodeColumns {
    pub fn property_types(&self) -> Vec<PhysicalType> {
        self.properties.iter().map(|c| c.data_type()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    InMemory,
    OnDisk,
}

enum ChunkedData {
    InMemory {
        chunks: Vec<ColumnChunk>,
        deleted: ColumnChunk,
    },
    /// Rows live in the table's columns
    OnDisk,
}

pub struct ChunkedNodeGroup {
    start_row_idx: RowIdx,
    num_rows: u64,
    data: ChunkedData,
}

impl ChunkedNodeGroup {
    pub fn new_in_memory(types: &[PhysicalType], capacity: u64, start_row_idx: RowIdx) -> Self {
        Self {
            start_row_idx,
            num_rows: 0,
            data: ChunkedData::InMemory {
                chunks: types.iter().map(|ty| ColumnChunk::new(*ty, capacity)).collect(),
                deleted: ColumnChunk::new(PhysicalType::Bool, capacity),
            },
        }
    }

    pub fn on_disk(num_rows: u64) -> Self {
        Self {
            start_row_idx: 0,
            num_rows,
            data: ChunkedData::OnDisk,
        }
    }

    pub fn residency(&self) -> Residency {
        match self.data {
            ChunkedData::InMemory { .. } => Residency::InMemory,
            ChunkedData::OnDisk => Residency::OnDisk,
        }
    }

    pub fn start_row_idx(&self) -> RowIdx {
        self.start_row_idx
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    fn remaining_capacity(&self) -> u64 {
        match &self.data {
            ChunkedData::InMemory { deleted, .. } => deleted.capacity() - self.num_rows,
            ChunkedData::OnDisk => 0,
        }
    }

    /// Appends up to `count` rows of `vectors` starting at `start`; returns how many fit.
    fn append(&mut self, vectors: &[ValueVector], start: usize, count: usize) -> Result<u64> {
        let n = (count as u64).min(self.remaining_capacity());
        let ChunkedData::InMemory { chunks, deleted } = &mut self.data else {
            return Ok(0);
        };
        let sel = SelectionVector::Filtered((start..start + n as usize).collect());
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.append(vector, &sel)?;
        }
        for _ in 0..n {
            deleted.append_value(Some(Value::Bool(false)))?;
        }
        self.num_rows += n;
        Ok(n)
    }

    fn scan(
        &self,
        columns: &NodeColumns,
        node_group_idx: NodeGroupIdx,
        column_ids: &[ColumnId],
        start: u64,
        count: u64,
        outs: &mut [ValueVector],
    ) -> Result<Vec<bool>> {
        let end = start + count;
        match &self.data {
            ChunkedData::InMemory { chunks, deleted } => {
                for (out, column_id) in outs.iter_mut().zip(column_ids) {
                    chunks[*column_id].scan(start, end, out, 0)?;
                }
                Ok((start..end).map(|row| deleted.get_value(row) == Some(Value::Bool(true))).collect())
            }
            ChunkedData::OnDisk => {
                let from = self.start_row_idx + start;
                for (out, column_id) in outs.iter_mut().zip(column_ids) {
                    columns.properties[*column_id].scan(node_group_idx, from, from + count, out, 0)?;
                }
                let flags = columns.deleted.scan_range(node_group_idx, from, from + count)?;
                Ok(flags.values().map(|v| v == Some(Value::Bool(true))).collect())
            }
        }
    }

    fn lookup(
        &self,
        columns: &NodeColumns,
        node_group_idx: NodeGroupIdx,
        row: u64,
        column_id: ColumnId,
    ) -> Result<Option<Value>> {
        match &self.data {
            ChunkedData::InMemory { chunks, .. } => Ok(chunks[column_id].get_value(row)),
            ChunkedData::OnDisk => columns.properties[column_id].lookup(node_group_idx, self.start_row_idx + row),
        }
    }

    fn is_deleted(&self, columns: &NodeColumns, node_group_idx: NodeGroupIdx, row: u64) -> Result<bool> {
        let flag = match &self.data {
            ChunkedData::InMemory { deleted, .. } => deleted.get_value(row),
            ChunkedData::OnDisk => columns.deleted.lookup(node_group_idx, self.start_row_idx + row)?,
        };
        Ok(flag == Some(Value::Bool(true)))
    }

    fn update(
        &mut self,
        transaction: &Transaction,
        columns: &NodeColumns,
        node_group_idx: NodeGroupIdx,
        row: u64,
        column_id: ColumnId,
        value: Option<Value>,
    ) -> Result<()> {
        let column = &columns.properties[column_id];
        match &mut self.data {
            ChunkedData::InMemory { chunks, .. } => chunks[column_id]
                .set_value(row, value)
                .map_err(|e| e.in_column(column.name())),
            ChunkedData::OnDisk => {
                let chunk = ColumnChunk::from_values(column.data_type(), &[value])
                    .map_err(|e| e.in_column(column.name()))?;
                column.prepare_commit_for_chunk(transaction, node_group_idx, &[self.start_row_idx + row], &chunk, 0)
            }
        }
    }

    fn delete(
        &mut self,
        transaction: &Transaction,
        columns: &NodeColumns,
        node_group_idx: NodeGroupIdx,
        row: u64,
    ) -> Result<bool> {
        if self.is_deleted(columns, node_group_idx, row)? {
            return Ok(false);
        }
        match &mut self.data {
            ChunkedData::InMemory { deleted, .. } => deleted.set_value(row, Some(Value::Bool(true)))?,
            ChunkedData::OnDisk => {
                let flag = ColumnChunk::from_values(PhysicalType::Bool, &[Some(Value::Bool(true))])?;
                columns.deleted.prepare_commit_for_chunk(
                    transaction,
                    node_group_idx,
                    &[self.start_row_idx + row],
                    &flag,
                    0,
                )?;
            }
        }
        Ok(true)
    }

    /// Appends this group's committed rows to the checkpoint's merged chunks.
    fn copy_into(
        &self,
        columns: &NodeColumns,
        node_group_idx: NodeGroupIdx,
        merged: &mut [ColumnChunk],
        merged_deleted: &mut ColumnChunk,
    ) -> Result<()> {
        match &self.data {
            ChunkedData::InMemory { chunks, deleted } => {
                for (dst, src) in merged.iter_mut().zip(chunks) {
                    dst.append_chunk(src, 0, self.num_rows)?;
                }
                merged_deleted.append_chunk(deleted, 0, self.num_rows)?;
            }
            ChunkedData::OnDisk => {
                let (from, to) = (self.start_row_idx, self.start_row_idx + self.num_rows);
                for (dst, column) in merged.iter_mut().zip(&columns.properties) {
                    let at = dst.num_values();
                    column.scan_into_chunk(node_group_idx, from, to, dst, at)?;
                }
                let at = merged_deleted.num_values();
                columns.deleted.scan_into_chunk(node_group_idx, from, to, merged_deleted, at)?;
            }
        }
        Ok(())
    }
}

/// Resumable position of a scan over one node group.
#[derive(Debug, Clone)]
pub struct NodeGroupScanState {
    pub column_ids: Vec<ColumnId>,
    chunked_group_idx: usize,
    row_in_chunked_group: u64,
    /// Node-group row of output position 0 in the last batch
    pub batch_start_row: RowIdx,
}

impl NodeGroupScanState {
    pub fn new(column_ids: Vec<ColumnId>) -> Self {
        Self {
            column_ids,
            chunked_group_idx: 0,
            row_in_chunked_group: 0,
            batch_start_row: 0,
        }
    }
}

pub struct NodeGroup {
    node_group_idx: NodeGroupIdx,
    capacity: u64,
    chunk_capacity: u64,
    vector_capacity: usize,
    columns: Arc<NodeColumns>,
    chunked_groups: Mutex<Vec<Arc<RwLock<ChunkedNodeGroup>>>>,
    num_rows: AtomicU64,
}

impl NodeGroup {
    pub fn new(node_group_idx: NodeGroupIdx, columns: Arc<NodeColumns>, config: &StorageConfig) -> Self {
        Self {
            node_group_idx,
            capacity: config.node_group_size(),
            chunk_capacity: config.chunked_node_group_capacity(),
            vector_capacity: config.vector_capacity(),
            columns,
            chunked_groups: Mutex::new(Vec::new()),
            num_rows: AtomicU64::new(0),
        }
    }

    /// Node group whose `num_rows` rows are already persisted.
    pub fn from_disk(
        node_group_idx: NodeGroupIdx,
        columns: Arc<NodeColumns>,
        config: &StorageConfig,
        num_rows: u64,
    ) -> Self {
        let group = Self::new(node_group_idx, columns, config);
        if num_rows > 0 {
            group
                .chunked_groups
                .lock()
                .push(Arc::new(RwLock::new(ChunkedNodeGroup::on_disk(num_rows))));
            group.num_rows.store(num_rows, Ordering::Release);
        }
        group
    }

    pub fn node_group_idx(&self) -> NodeGroupIdx {
        self.node_group_idx
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.num_rows() >= self.capacity
    }

    pub fn num_chunked_groups(&self) -> usize {
        self.chunked_groups.lock().len()
    }

    /// Copies rows `[start, start + num_rows_to_append)` of `vectors` into trailing chunked groups.
    ///
    /// Returns how many rows fit before the node group filled up.
    pub fn append(
        &self,
        transaction: &Transaction,
        vectors: &[ValueVector],
        start: usize,
        num_rows_to_append: usize,
    ) -> Result<u64> {
        assert!(transaction.is_write_transaction(), "append from read-only transaction");
        let mut groups = self.chunked_groups.lock();
        let to_append = (num_rows_to_append as u64).min(self.capacity - self.num_rows());
        let types = self.columns.property_types();
        let mut appended = 0u64;
        while appended < to_append {
            let last = match groups.last() {
                Some(last) if last.read().remaining_capacity() > 0 => Arc::clone(last),
                _ => {
                    let start_row = self.num_rows() + appended;
                    let capacity = self.chunk_capacity.min(self.capacity - start_row);
                    let group = Arc::new(RwLock::new(ChunkedNodeGroup::new_in_memory(&types, capacity, start_row)));
                    groups.push(Arc::clone(&group));
                    group
                }
            };
            let n = last.write().append(
                vectors,
                start + appended as usize,
                (to_append - appended) as usize,
            )?;
            appended += n;
        }
        self.num_rows.fetch_add(appended, Ordering::AcqRel);
        Ok(appended)
    }

    /// Finds the chunked group owning `row` and the row's position inside it.
    fn locate(&self, row: RowIdx) -> (Arc<RwLock<ChunkedNodeGroup>>, u64) {
        assert!(row < self.num_rows(), "row {} beyond node group size {}", row, self.num_rows());
        let groups = self.chunked_groups.lock();
        let first = groups[0].read();
        let idx = match first.residency() {
            Residency::OnDisk if row < first.num_rows() => 0,
            Residency::OnDisk => 1 + ((row - first.num_rows()) / self.chunk_capacity) as usize,
            Residency::InMemory => (row / self.chunk_capacity) as usize,
        };
        drop(first);
        let group = Arc::clone(&groups[idx]);
        let start = group.read().start_row_idx();
        (group, row - start)
    }

    pub fn lookup(&self, row: RowIdx, column_id: ColumnId) -> Result<Option<Value>> {
        let (group, pos) = self.locate(row);
        let group = group.read();
        group.lookup(&self.columns, self.node_group_idx, pos, column_id)
    }

    pub fn is_deleted(&self, row: RowIdx) -> Result<bool> {
        let (group, pos) = self.locate(row);
        let group = group.read();
        group.is_deleted(&self.columns, self.node_group_idx, pos)
    }

    pub fn update(
        &self,
        transaction: &Transaction,
        row: RowIdx,
        column_id: ColumnId,
        value: Option<Value>,
    ) -> Result<()> {
        let (group, pos) = self.locate(row);
        let mut group = group.write();
        group.update(transaction, &self.columns, self.node_group_idx, pos, column_id, value)
    }

    /// Marks a row deleted; `false` if it already was.
    pub fn delete(&self, transaction: &Transaction, row: RowIdx) -> Result<bool> {
        let (group, pos) = self.locate(row);
        let mut group = group.write();
        group.delete(transaction, &self.columns, self.node_group_idx, pos)
    }

    /// Scans the next batch into `outs` (one vector per `state.column_ids`).
    ///
    /// Returns the number of rows in the batch, 0 once the node group is
    /// exhausted. Deleted rows are left out of the output selection vectors.
    pub fn scan(&self, state: &mut NodeGroupScanState, outs: &mut [ValueVector]) -> Result<usize> {
        loop {
            let group = {
                let groups = self.chunked_groups.lock();
                match groups.get(state.chunked_group_idx) {
                    Some(group) => Arc::clone(group),
                    None => return Ok(0),
                }
            };
            let group = group.read();
            let remaining = group.num_rows() - state.row_in_chunked_group;
            if remaining == 0 {
                state.chunked_group_idx += 1;
                state.row_in_chunked_group = 0;
                continue;
            }
            let count = remaining.min(self.vector_capacity as u64);
            let deleted = group.scan(
                &self.columns,
                self.node_group_idx,
                &state.column_ids,
                state.row_in_chunked_group,
                count,
                outs,
            )?;
            state.batch_start_row = group.start_row_idx() + state.row_in_chunked_group;
            state.row_in_chunked_group += count;

            let visible: Vec<usize> = (0..count as usize).filter(|i| !deleted[*i]).collect();
            let sel = if visible.len() == count as usize {
                SelectionVector::unfiltered(count as usize)
            } else {
                SelectionVector::Filtered(visible)
            };
            for out in outs.iter_mut() {
                out.sel = sel.clone();
            }
            return Ok(count as usize);
        }
    }

    /// Merges on-disk and in-memory rows into one persisted chunk per column.
    ///
    /// Every new chunk is written before any metadata entry is swapped, so a
    /// failure leaves the previous on-disk state in place. Returns whether
    /// anything was written.
    pub fn checkpoint(&self) -> Result<bool> {
        let mut groups = self.chunked_groups.lock();
        let dirty = groups.iter().any(|g| g.read().residency() == Residency::InMemory);
        if !dirty {
            return Ok(false);
        }
        let num_rows = self.num_rows();
        let mut merged: Vec<ColumnChunk> = self
            .columns
            .property_types()
            .into_iter()
            .map(|ty| ColumnChunk::new(ty, num_rows))
            .collect();
        let mut merged_deleted = ColumnChunk::new(PhysicalType::Bool, num_rows);
        for group in groups.iter() {
            group
                .read()
                .copy_into(&self.columns, self.node_group_idx, &mut merged, &mut merged_deleted)?;
        }

        let metas = merged
            .iter()
            .zip(&self.columns.properties)
            .map(|(chunk, column)| column.write_chunk(chunk))
            .collect::<Result<Vec<_>>>()?;
        let deleted_meta = self.columns.deleted.write_chunk(&merged_deleted)?;

        for (column, meta) in self.columns.properties.iter().zip(metas) {
            column.set_chunk_metadata(self.node_group_idx, meta);
        }
        self.columns.deleted.set_chunk_metadata(self.node_group_idx, deleted_meta);
        *groups = vec![Arc::new(RwLock::new(ChunkedNodeGroup::on_disk(num_rows)))];

        tracing::debug!(node_group = self.node_group_idx, num_rows, "Checkpointed node group");
        Ok(true)
    }
}

/// All node groups of one table.
pub struct NodeGroupCollection {
    columns: Arc<NodeColumns>,
    config: StorageConfig,
    node_groups: Mutex<Vec<Arc<NodeGroup>>>,
}

impl NodeGroupCollection {
    pub fn new(columns: Arc<NodeColumns>, config: StorageConfig) -> Self {
        Self {
            columns,
            config,
            node_groups: Mutex::new(Vec::new()),
        }
    }

    /// Rebuilds the collection from the row counts recorded by the deletion column.
    pub fn load(columns: Arc<NodeColumns>, config: StorageConfig) -> Self {
        let groups = (0..columns.deleted.num_node_groups())
            .map(|idx| {
                let num_rows = columns.deleted.num_values(idx);
                Arc::new(NodeGroup::from_disk(idx, Arc::clone(&columns), &config, num_rows))
            })
            .collect();
        Self {
            columns,
            config,
            node_groups: Mutex::new(groups),
        }
    }

    pub fn columns(&self) -> &Arc<NodeColumns> {
        &self.columns
    }

    pub fn num_node_groups(&self) -> usize {
        self.node_groups.lock().len()
    }

    pub fn get(&self, node_group_idx: NodeGroupIdx) -> Option<Arc<NodeGroup>> {
        self.node_groups.lock().get(node_group_idx as usize).cloned()
    }

    pub fn num_rows(&self) -> u64 {
        self.node_groups.lock().iter().map(|g| g.num_rows()).sum()
    }

    /// Appends `num_rows` rows, opening new node groups as earlier ones fill up.
    /// Returns the table offset of the first appended row.
    pub fn append(&self, transaction: &Transaction, vectors: &[ValueVector], num_rows: usize) -> Result<Offset> {
        let mut groups = self.node_groups.lock();
        let start_offset = groups.iter().map(|g| g.num_rows()).sum::<u64>();
        let mut appended = 0usize;
        while appended < num_rows {
            let last = match groups.last() {
                Some(last) if !last.is_full() => Arc::clone(last),
                _ => {
                    let idx = groups.len() as NodeGroupIdx;
                    let group = Arc::new(NodeGroup::new(idx, Arc::clone(&self.columns), &self.config));
                    groups.push(Arc::clone(&group));
                    group
                }
            };
            appended += last.append(transaction, vectors, appended, num_rows - appended)? as usize;
        }
        Ok(start_offset)
    }

    /// Checkpoints every node group in parallel; returns how many were rewritten.
    pub fn checkpoint(&self) -> Result<usize> {
        let groups: Vec<Arc<NodeGroup>> = self.node_groups.lock().clone();
        let rewritten = groups
            .par_iter()
            .map(|group| group.checkpoint())
            .collect::<Result<Vec<bool>>>()?;
        Ok(rewritten.into_iter().filter(|r| *r).count())
    }
}
