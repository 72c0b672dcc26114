//! Node table: property columns over a collection of node groups
//!
//! A write transaction stages rows in its [`LocalNodeTable`]; reads by that
//! transaction merge the staged rows and edits over committed data.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::transaction::Transaction;
use super::column::{Column, ColumnSnapshot};
use super::local::LocalNodeTable;
use super::node_group::{NodeColumns, NodeGroup, NodeGroupCollection, NodeGroupScanState};
use super::pager::BufferManager;
use super::vector::ValueVector;
use super::wal::Wal;
use super::{split_offset, ColumnId, Offset, PhysicalType, TableId, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTableSnapshot {
    pub table_id: TableId,
    pub name: String,
    pub properties: Vec<(String, PhysicalType)>,
    pub columns: Vec<ColumnSnapshot>,
    pub deleted: ColumnSnapshot,
}

pub struct NodeTable {
    table_id: TableId,
    name: String,
    properties: Vec<(String, PhysicalType)>,
    config: StorageConfig,
    node_groups: NodeGroupCollection,
    wal: Arc<dyn Wal>,
}

impl NodeTable {
    pub fn new(
        table_id: TableId,
        name: &str,
        properties: Vec<(String, PhysicalType)>,
        bm: Arc<BufferManager>,
        wal: Arc<dyn Wal>,
        config: StorageConfig,
    ) -> Self {
        let max_values = Some(config.node_group_size());
        let compression = config.enable_compression;
        let columns = NodeColumns {
            properties: properties
                .iter()
                .map(|(prop, ty)| Column::new(format!("{}_{}", name, prop), *ty, Arc::clone(&bm), max_values, compression))
                .collect(),
            deleted: Column::new(format!("{}__deleted", name), PhysicalType::Bool, bm, max_values, compression),
        };
        Self {
            table_id,
            name: name.to_string(),
            properties,
            config,
            node_groups: NodeGroupCollection::new(Arc::new(columns), config),
            wal,
        }
    }

    pub fn from_snapshot(
        snapshot: NodeTableSnapshot,
        bm: Arc<BufferManager>,
        wal: Arc<dyn Wal>,
        config: StorageConfig,
    ) -> Self {
        let max_values = Some(config.node_group_size());
        let compression = config.enable_compression;
        let columns = NodeColumns {
            properties: snapshot
                .columns
                .into_iter()
                .map(|c| Column::from_snapshot(c, Arc::clone(&bm), max_values, compression))
                .collect(),
            deleted: Column::from_snapshot(snapshot.deleted, bm, max_values, compression),
        };
        Self {
            table_id: snapshot.table_id,
            name: snapshot.name,
            properties: snapshot.properties,
            config,
            node_groups: NodeGroupCollection::load(Arc::new(columns), config),
            wal,
        }
    }

    /// Column metadata as last checkpointed.
    pub fn snapshot(&self) -> NodeTableSnapshot {
        let columns = self.node_groups.columns();
        NodeTableSnapshot {
            table_id: self.table_id,
            name: self.name.clone(),
            properties: self.properties.clone(),
            columns: columns.properties.iter().map(|c| c.snapshot()).collect(),
            deleted: columns.deleted.snapshot(),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &[(String, PhysicalType)] {
        &self.properties
    }

    /// Committed rows, deleted ones included.
    pub fn num_rows(&self) -> u64 {
        self.node_groups.num_rows()
    }

    pub fn num_node_groups(&self) -> usize {
        self.node_groups.num_node_groups()
    }

    fn property_column(&self, property_idx: usize) -> Result<ColumnId> {
        if property_idx >= self.properties.len() {
            return Err(StorageError::PropertyNotFound {
                table: self.name.clone(),
                index: property_idx,
            });
        }
        Ok(property_idx)
    }

    fn cast_row(&self, values: &[Option<Value>]) -> Result<Vec<Option<Value>>> {
        if values.len() != self.properties.len() {
            return Err(StorageError::ArityMismatch {
                table: self.name.clone(),
                expected: self.properties.len(),
                actual: values.len(),
            });
        }
        values
            .iter()
            .zip(&self.properties)
            .map(|(value, (prop, ty))| value.map(|v| v.cast(*ty)).transpose().map_err(|e| e.in_column(prop)))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.in_table(&self.name))
    }

    fn local_mut<'a>(&self, transaction: &'a mut Transaction) -> &'a mut LocalNodeTable {
        let start = self.num_rows();
        transaction
            .local_storage_mut()
            .node_table_or_insert_with(self.table_id, || LocalNodeTable::new(start))
    }

    /// Stages a row; its offset is final immediately.
    pub fn insert(&self, transaction: &mut Transaction, values: &[Option<Value>]) -> Result<Offset> {
        transaction.ensure_write()?;
        let row = self.cast_row(values)?;
        Ok(self.local_mut(transaction).insert(row))
    }

    /// Stages a property update; `false` when the row is not visible.
    pub fn update(
        &self,
        transaction: &mut Transaction,
        offset: Offset,
        property_idx: usize,
        value: Option<Value>,
    ) -> Result<bool> {
        transaction.ensure_write()?;
        let column_id = self.property_column(property_idx)?;
        if !self.exists(transaction, offset)? {
            return Ok(false);
        }
        let (prop, ty) = &self.properties[column_id];
        let value = value
            .map(|v| v.cast(*ty))
            .transpose()
            .map_err(|e| e.in_column(prop).in_table(&self.name))?;
        self.local_mut(transaction).update(offset, column_id, value);
        Ok(true)
    }

    pub fn delete(&self, transaction: &mut Transaction, offset: Offset) -> Result<bool> {
        transaction.ensure_write()?;
        if !self.exists(transaction, offset)? {
            return Ok(false);
        }
        Ok(self.local_mut(transaction).delete(offset))
    }

    fn local<'a>(&self, transaction: &'a Transaction) -> Option<&'a LocalNodeTable> {
        if !transaction.is_write_transaction() {
            return None;
        }
        transaction.local_storage().node_table(self.table_id)
    }

    pub fn exists(&self, transaction: &Transaction, offset: Offset) -> Result<bool> {
        if let Some(local) = self.local(transaction) {
            if local.is_deleted(offset) {
                return Ok(false);
            }
            if local.is_local(offset) {
                return Ok(true);
            }
        }
        if offset >= self.num_rows() {
            return Ok(false);
        }
        let (group_idx, row) = split_offset(offset, self.config.node_group_size_log2);
        match self.node_groups.get(group_idx) {
            Some(group) => Ok(!group.is_deleted(row)?),
            None => Ok(false),
        }
    }

    pub fn lookup(&self, transaction: &Transaction, offset: Offset, property_idx: usize) -> Result<Option<Value>> {
        let column_id = self.property_column(property_idx)?;
        if !self.exists(transaction, offset)? {
            return Err(StorageError::NodeNotFound {
                table: self.name.clone(),
                offset,
            });
        }
        if let Some(value) = self.local(transaction).and_then(|l| l.get(offset, column_id)) {
            return Ok(value);
        }
        let (group_idx, row) = split_offset(offset, self.config.node_group_size_log2);
        match self.node_groups.get(group_idx) {
            Some(group) => group.lookup(row, column_id),
            None => Ok(None),
        }
    }

    /// Every visible row as `(offset, requested properties)`, in offset order.
    pub fn scan(&self, transaction: &Transaction, property_ids: &[usize]) -> Result<Vec<(Offset, Vec<Option<Value>>)>> {
        let column_ids = property_ids
            .iter()
            .map(|idx| self.property_column(*idx))
            .collect::<Result<Vec<_>>>()?;
        let local = self.local(transaction);
        let capacity = self.config.vector_capacity();
        let mut outs: Vec<ValueVector> = column_ids
            .iter()
            .map(|c| ValueVector::new(self.properties[*c].1, capacity))
            .collect();

        let mut rows = Vec::new();
        for group_idx in 0..self.node_groups.num_node_groups() as u64 {
            let Some(group) = self.node_groups.get(group_idx) else {
                continue;
            };
            let base = group_idx << self.config.node_group_size_log2;
            let mut state = NodeGroupScanState::new(column_ids.clone());
            loop {
                let count = group.scan(&mut state, &mut outs)?;
                if count == 0 {
                    break;
                }
                let sel = match outs.first() {
                    Some(out) => out.sel.iter().collect::<Vec<_>>(),
                    None => group_visible_rows(&group, state.batch_start_row, count)?,
                };
                for i in sel {
                    let offset = base + state.batch_start_row + i as u64;
                    if local.is_some_and(|l| l.is_deleted(offset)) {
                        continue;
                    }
                    let values = column_ids
                        .iter()
                        .zip(&outs)
                        .map(|(c, out)| match local.and_then(|l| l.get(offset, *c)) {
                            Some(value) => value,
                            None => out.get_value(i),
                        })
                        .collect();
                    rows.push((offset, values));
                }
            }
        }

        if let Some(local) = local {
            for (i, row) in local.inserted_rows().iter().enumerate() {
                let offset = local.start_offset() + i as u64;
                if local.is_deleted(offset) {
                    continue;
                }
                rows.push((offset, column_ids.iter().map(|c| row[*c]).collect()));
            }
        }
        Ok(rows)
    }

    /// Applies staged rows, then updates, then deletes.
    pub fn prepare_commit(&self, transaction: &Transaction) -> Result<()> {
        let Some(local) = transaction.local_storage().node_table(self.table_id) else {
            return Ok(());
        };
        let inserted = local.inserted_rows();
        if inserted.is_empty() && local.updates().is_empty() && local.deletes().is_empty() {
            return Ok(());
        }
        assert_eq!(
            local.start_offset(),
            self.num_rows(),
            "node table {} changed under a staged transaction",
            self.name
        );
        let num_rows = self.num_rows() + inserted.len() as u64;
        self.wal.add_to_updated_tables(self.table_id)?;
        self.wal.log_table_statistics(self.table_id, num_rows)?;

        if !inserted.is_empty() {
            let vectors = self
                .properties
                .iter()
                .enumerate()
                .map(|(c, (_, ty))| {
                    let values: Vec<Option<Value>> = inserted.iter().map(|row| row[c]).collect();
                    ValueVector::from_values(*ty, &values)
                })
                .collect::<Result<Vec<_>>>()?;
            self.node_groups
                .append(transaction, &vectors, inserted.len())
                .map_err(|e| e.in_table(&self.name))?;
        }
        for ((offset, column_id), value) in local.updates() {
            let (group_idx, row) = split_offset(*offset, self.config.node_group_size_log2);
            if let Some(group) = self.node_groups.get(group_idx) {
                group
                    .update(transaction, row, *column_id, *value)
                    .map_err(|e| e.in_table(&self.name))?;
            }
        }
        for offset in local.deletes() {
            let (group_idx, row) = split_offset(*offset, self.config.node_group_size_log2);
            if let Some(group) = self.node_groups.get(group_idx) {
                group.delete(transaction, row).map_err(|e| e.in_table(&self.name))?;
            }
        }
        tracing::debug!(
            table = %self.name,
            inserted = inserted.len(),
            updated = local.updates().len(),
            deleted = local.deletes().len(),
            "Committed node table"
        );
        Ok(())
    }

    /// Persists in-memory rows; returns how many node groups were rewritten.
    pub fn checkpoint(&self) -> Result<usize> {
        self.node_groups.checkpoint().map_err(|e| e.in_table(&self.name))
    }
}

/// Non-deleted positions of a batch when no property vector carries the selection.
fn group_visible_rows(group: &NodeGroup, start_row: u64, count: usize) -> Result<Vec<usize>> {
    let mut visible = Vec::with_capacity(count);
    for i in 0..count {
        if !group.is_deleted(start_row + i as u64)? {
            visible.push(i);
        }
    }
    Ok(visible)
}
