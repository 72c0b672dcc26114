//! Relationship table: forward and backward storage of one edge label

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::transaction::Transaction;
use super::local::{LocalRelNg, LocalRelTable};
use super::pager::BufferManager;
use super::rel_table_data::{
    BulkEdge, CommitState, RelDataFormat, RelDataReadState, RelDirection, RelTableData, RelTableDataSnapshot,
    REL_ID_COLUMN_ID,
};
use super::vector::ValueVector;
use super::wal::Wal;
use super::{split_offset, ColumnId, NodeGroupIdx, Offset, PhysicalType, RelId, TableId, Value};

/// How many edges a vertex may have per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelMultiplicity {
    ManyToMany,
    /// Each source has at most one outgoing edge
    ManyToOne,
    /// Each destination has at most one incoming edge
    OneToMany,
    OneToOne,
}

impl RelMultiplicity {
    /// Storage format of the `(forward, backward)` directions.
    pub fn formats(self) -> (RelDataFormat, RelDataFormat) {
        match self {
            RelMultiplicity::ManyToMany => (RelDataFormat::Csr, RelDataFormat::Csr),
            RelMultiplicity::ManyToOne => (RelDataFormat::Regular, RelDataFormat::Csr),
            RelMultiplicity::OneToMany => (RelDataFormat::Csr, RelDataFormat::Regular),
            RelMultiplicity::OneToOne => (RelDataFormat::Regular, RelDataFormat::Regular),
        }
    }
}

/// One edge as seen from the vertex it was scanned from.
#[derive(Debug, Clone, PartialEq)]
pub struct RelRow {
    pub nbr: Offset,
    pub rel_id: RelId,
    pub properties: Vec<Option<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelTableSnapshot {
    pub table_id: TableId,
    pub name: String,
    pub src_table: TableId,
    pub dst_table: TableId,
    pub multiplicity: RelMultiplicity,
    pub properties: Vec<(String, PhysicalType)>,
    pub next_rel_id: RelId,
    pub num_rels: u64,
    pub fwd: RelTableDataSnapshot,
    pub bwd: RelTableDataSnapshot,
}

pub struct RelTable {
    table_id: TableId,
    name: String,
    src_table: TableId,
    dst_table: TableId,
    multiplicity: RelMultiplicity,
    properties: Vec<(String, PhysicalType)>,
    config: StorageConfig,
    fwd: RelTableData,
    bwd: RelTableData,
    next_rel_id: AtomicU64,
    num_rels: AtomicU64,
    /// Held exclusively while a commit rewrites persistent data
    commit_lock: RwLock<()>,
    wal: Arc<dyn Wal>,
}

impl RelTable {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table_id: TableId,
        name: &str,
        src_table: TableId,
        dst_table: TableId,
        multiplicity: RelMultiplicity,
        properties: Vec<(String, PhysicalType)>,
        bm: Arc<BufferManager>,
        wal: Arc<dyn Wal>,
        config: StorageConfig,
    ) -> Self {
        let (fwd_format, bwd_format) = multiplicity.formats();
        let fwd = RelTableData::new(
            table_id,
            name,
            RelDirection::Forward,
            fwd_format,
            &properties,
            Arc::clone(&bm),
            config,
        );
        let bwd = RelTableData::new(table_id, name, RelDirection::Backward, bwd_format, &properties, bm, config);
        Self {
            table_id,
            name: name.to_string(),
            src_table,
            dst_table,
            multiplicity,
            properties,
            config,
            fwd,
            bwd,
            next_rel_id: AtomicU64::new(0),
            num_rels: AtomicU64::new(0),
            commit_lock: RwLock::new(()),
            wal,
        }
    }

    pub fn from_snapshot(
        snapshot: RelTableSnapshot,
        bm: Arc<BufferManager>,
        wal: Arc<dyn Wal>,
        config: StorageConfig,
    ) -> Result<Self> {
        let name = snapshot.name;
        let fwd = RelTableData::from_snapshot(snapshot.table_id, &name, snapshot.fwd, Arc::clone(&bm), config)
            .map_err(|e| e.in_table(&name))?;
        let bwd = RelTableData::from_snapshot(snapshot.table_id, &name, snapshot.bwd, bm, config)
            .map_err(|e| e.in_table(&name))?;
        Ok(Self {
            table_id: snapshot.table_id,
            name,
            src_table: snapshot.src_table,
            dst_table: snapshot.dst_table,
            multiplicity: snapshot.multiplicity,
            properties: snapshot.properties,
            config,
            fwd,
            bwd,
            next_rel_id: AtomicU64::new(snapshot.next_rel_id),
            num_rels: AtomicU64::new(snapshot.num_rels),
            commit_lock: RwLock::new(()),
            wal,
        })
    }

    pub fn snapshot(&self) -> RelTableSnapshot {
        let _guard = self.commit_lock.read();
        RelTableSnapshot {
            table_id: self.table_id,
            name: self.name.clone(),
            src_table: self.src_table,
            dst_table: self.dst_table,
            multiplicity: self.multiplicity,
            properties: self.properties.clone(),
            next_rel_id: self.next_rel_id.load(Ordering::SeqCst),
            num_rels: self.num_rels.load(Ordering::SeqCst),
            fwd: self.fwd.snapshot(),
            bwd: self.bwd.snapshot(),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn src_table(&self) -> TableId {
        self.src_table
    }

    pub fn dst_table(&self) -> TableId {
        self.dst_table
    }

    pub fn multiplicity(&self) -> RelMultiplicity {
        self.multiplicity
    }

    pub fn properties(&self) -> &[(String, PhysicalType)] {
        &self.properties
    }

    /// Committed edge count.
    pub fn num_rels(&self) -> u64 {
        self.num_rels.load(Ordering::SeqCst)
    }

    pub fn direction(&self, direction: RelDirection) -> &RelTableData {
        match direction {
            RelDirection::Forward => &self.fwd,
            RelDirection::Backward => &self.bwd,
        }
    }

    fn local_node_group<'a>(
        &self,
        transaction: &'a mut Transaction,
        direction: RelDirection,
        node_group_idx: NodeGroupIdx,
    ) -> &'a mut LocalRelNg {
        transaction
            .local_storage_mut()
            .rel_table_or_insert_with(self.table_id, || LocalRelTable {
                fwd: self.fwd.new_local_data(),
                bwd: self.bwd.new_local_data(),
            })
            .direction_mut(direction)
            .get_or_create(node_group_idx)
    }

    fn split(&self, offset: Offset) -> (NodeGroupIdx, Offset) {
        split_offset(offset, self.config.node_group_size_log2)
    }

    fn check_arity(&self, actual: usize) -> Result<()> {
        if actual != self.properties.len() {
            return Err(StorageError::ArityMismatch {
                table: self.name.clone(),
                expected: self.properties.len(),
                actual,
            });
        }
        Ok(())
    }

    /// Stages an edge `src -> dst` and returns its rel id.
    pub fn insert(
        &self,
        transaction: &mut Transaction,
        src: Offset,
        dst: Offset,
        properties: &[Option<Value>],
    ) -> Result<RelId> {
        transaction.ensure_write()?;
        self.check_arity(properties.len())?;
        for (direction, bound) in [(RelDirection::Forward, src), (RelDirection::Backward, dst)] {
            if self.direction(direction).format() == RelDataFormat::Regular
                && !self.neighbors(transaction, direction, bound)?.is_empty()
            {
                return Err(StorageError::MultiplicityViolation {
                    table: self.name.clone(),
                    offset: bound,
                });
            }
        }

        let rel_id = self.next_rel_id.fetch_add(1, Ordering::SeqCst);
        let (src_group, src_pos) = self.split(src);
        let (dst_group, dst_pos) = self.split(dst);
        self.local_node_group(transaction, RelDirection::Forward, src_group)
            .insert(src_pos, dst, rel_id, properties)
            .map_err(|e| e.in_table(&self.name))?;
        self.local_node_group(transaction, RelDirection::Backward, dst_group)
            .insert(dst_pos, src, rel_id, properties)
            .map_err(|e| e.in_table(&self.name))?;
        Ok(rel_id)
    }

    /// Stages a property update; `false` when no visible edge `rel_id` runs
    /// from `src` to `dst`.
    pub fn update(
        &self,
        transaction: &mut Transaction,
        src: Offset,
        dst: Offset,
        rel_id: RelId,
        property_idx: usize,
        value: Option<Value>,
    ) -> Result<bool> {
        transaction.ensure_write()?;
        let column_id = self.property_column(property_idx)?;
        if !self.has_edge(transaction, src, dst, rel_id)? {
            return Ok(false);
        }
        let (src_group, src_pos) = self.split(src);
        let (dst_group, dst_pos) = self.split(dst);
        let fwd = self
            .local_node_group(transaction, RelDirection::Forward, src_group)
            .update(src_pos, rel_id, column_id, value)
            .map_err(|e| e.in_table(&self.name))?;
        let bwd = self
            .local_node_group(transaction, RelDirection::Backward, dst_group)
            .update(dst_pos, rel_id, column_id, value)
            .map_err(|e| e.in_table(&self.name))?;
        Ok(fwd && bwd)
    }

    /// Stages the removal of an edge. Returns `false` when no edge `rel_id`
    /// runs from `src` to `dst` or it was already deleted by this transaction.
    pub fn delete(&self, transaction: &mut Transaction, src: Offset, dst: Offset, rel_id: RelId) -> Result<bool> {
        transaction.ensure_write()?;
        if !self.has_edge(transaction, src, dst, rel_id)? {
            return Ok(false);
        }
        let (src_group, src_pos) = self.split(src);
        let (dst_group, dst_pos) = self.split(dst);
        let fwd = self
            .local_node_group(transaction, RelDirection::Forward, src_group)
            .delete(src_pos, rel_id);
        let bwd = self
            .local_node_group(transaction, RelDirection::Backward, dst_group)
            .delete(dst_pos, rel_id);
        Ok(fwd && bwd)
    }

    /// Whether edge `rel_id` runs from `src` to `dst`. Both directions are
    /// checked: a rel id stored at `src` alone says nothing about `dst`.
    fn has_edge(&self, transaction: &Transaction, src: Offset, dst: Offset, rel_id: RelId) -> Result<bool> {
        Ok(self.fwd.find_rel(transaction, src, rel_id)? && self.bwd.find_rel(transaction, dst, rel_id)?)
    }

    fn property_column(&self, property_idx: usize) -> Result<ColumnId> {
        if property_idx >= self.properties.len() {
            return Err(StorageError::PropertyNotFound {
                table: self.name.clone(),
                index: property_idx,
            });
        }
        Ok(property_idx + 1)
    }

    /// Edges of `node_offset` in `direction` with the requested properties.
    pub fn scan(
        &self,
        transaction: &Transaction,
        direction: RelDirection,
        node_offset: Offset,
        property_ids: &[usize],
    ) -> Result<Vec<RelRow>> {
        let column_ids = std::iter::once(Ok(REL_ID_COLUMN_ID))
            .chain(property_ids.iter().map(|idx| self.property_column(*idx)))
            .collect::<Result<Vec<_>>>()?;
        let data = self.direction(direction);
        let capacity = self.config.vector_capacity();
        let column_types = data.column_types();

        let _guard = self.commit_lock.read();
        let mut nbrs = ValueVector::new(PhysicalType::UInt64, capacity);
        let mut outs: Vec<ValueVector> = column_ids
            .iter()
            .map(|c| ValueVector::new(column_types[*c], capacity))
            .collect();
        let mut state = RelDataReadState::new(column_ids);
        data.initialize_read_state(transaction, node_offset, &mut state)?;

        let mut rows = Vec::new();
        while data.scan(transaction, &mut state, &mut nbrs, &mut outs)? > 0 {
            for i in nbrs.sel.iter() {
                let (Some(nbr), Some(rel_id)) = (
                    nbrs.get_value(i).and_then(|v| v.as_u64()),
                    outs[0].get_value(i).and_then(|v| v.as_u64()),
                ) else {
                    continue;
                };
                rows.push(RelRow {
                    nbr,
                    rel_id,
                    properties: outs[1..].iter().map(|out| out.get_value(i)).collect(),
                });
            }
        }
        Ok(rows)
    }

    /// Neighbour offsets of `node_offset` in `direction`.
    pub fn neighbors(&self, transaction: &Transaction, direction: RelDirection, node_offset: Offset) -> Result<Vec<Offset>> {
        let data = self.direction(direction);
        let capacity = self.config.vector_capacity();

        let _guard = self.commit_lock.read();
        let mut nbrs = ValueVector::new(PhysicalType::UInt64, capacity);
        let mut state = RelDataReadState::new(Vec::new());
        data.initialize_read_state(transaction, node_offset, &mut state)?;
        let mut result = Vec::new();
        while data.scan(transaction, &mut state, &mut nbrs, &mut [])? > 0 {
            result.extend(nbrs.selected_values().into_iter().flatten().filter_map(|v| v.as_u64()));
        }
        Ok(result)
    }

    /// Bulk loads `(src, dst, properties)` edges into an empty table. Rel ids
    /// are assigned in input order.
    pub fn copy_from(&self, edges: &[(Offset, Offset, Vec<Option<Value>>)]) -> Result<()> {
        let _guard = self.commit_lock.write();
        let is_empty = self.next_rel_id.load(Ordering::SeqCst) == 0
            && self.fwd.num_node_groups() == 0
            && self.bwd.num_node_groups() == 0;
        if !is_empty {
            return Err(StorageError::TableNotEmpty(self.name.clone()));
        }

        let types: Vec<PhysicalType> = self.properties.iter().map(|(_, ty)| *ty).collect();
        let mut fwd_groups: BTreeMap<NodeGroupIdx, Vec<BulkEdge>> = BTreeMap::new();
        let mut bwd_groups: BTreeMap<NodeGroupIdx, Vec<BulkEdge>> = BTreeMap::new();
        for (rel_id, (src, dst, properties)) in edges.iter().enumerate() {
            self.check_arity(properties.len())?;
            let properties = properties
                .iter()
                .zip(&types)
                .map(|(value, ty)| value.map(|v| v.cast(*ty)).transpose())
                .collect::<Result<Vec<_>>>()
                .map_err(|e| e.in_table(&self.name))?;
            let (src_group, src_pos) = self.split(*src);
            let (dst_group, dst_pos) = self.split(*dst);
            fwd_groups.entry(src_group).or_default().push(BulkEdge {
                offset_in_group: src_pos,
                nbr: *dst,
                rel_id: rel_id as RelId,
                properties: properties.clone(),
            });
            bwd_groups.entry(dst_group).or_default().push(BulkEdge {
                offset_in_group: dst_pos,
                nbr: *src,
                rel_id: rel_id as RelId,
                properties,
            });
        }

        for (direction, groups) in [(RelDirection::Forward, &fwd_groups), (RelDirection::Backward, &bwd_groups)] {
            if self.direction(direction).format() != RelDataFormat::Regular {
                continue;
            }
            for (group, group_edges) in groups {
                let mut seen = BTreeSet::new();
                if let Some(edge) = group_edges.iter().find(|e| !seen.insert(e.offset_in_group)) {
                    return Err(StorageError::MultiplicityViolation {
                        table: self.name.clone(),
                        offset: (group << self.config.node_group_size_log2) + edge.offset_in_group,
                    });
                }
            }
        }

        for (group, group_edges) in &fwd_groups {
            self.fwd.append_node_group(*group, group_edges).map_err(|e| e.in_table(&self.name))?;
        }
        for (group, group_edges) in &bwd_groups {
            self.bwd.append_node_group(*group, group_edges).map_err(|e| e.in_table(&self.name))?;
        }
        self.next_rel_id.store(edges.len() as u64, Ordering::SeqCst);
        self.num_rels.store(edges.len() as u64, Ordering::SeqCst);
        self.wal.add_to_updated_tables(self.table_id)?;
        self.wal.log_table_statistics(self.table_id, edges.len() as u64)?;
        tracing::info!(table = %self.name, edges = edges.len(), "Bulk loaded rel table");
        Ok(())
    }

    /// Merges the transaction's staged edges into both directions. The WAL
    /// hooks run before any data is written.
    pub fn prepare_commit(&self, transaction: &Transaction) -> Result<CommitState> {
        let Some(local) = transaction.local_storage().rel_table(self.table_id) else {
            return Ok(CommitState::Idle);
        };
        if local.fwd.is_empty() && local.bwd.is_empty() {
            return Ok(CommitState::Idle);
        }
        let _guard = self.commit_lock.write();
        let delta: i64 = local.fwd.node_groups().map(|(_, ng)| ng.info().net_size_change()).sum();
        let num_rels = (self.num_rels.load(Ordering::SeqCst) as i64 + delta).max(0) as u64;
        self.wal.add_to_updated_tables(self.table_id)?;
        self.wal.log_table_statistics(self.table_id, num_rels)?;

        let fwd = self.fwd.prepare_commit(transaction).map_err(|e| e.in_table(&self.name))?;
        let bwd = self.bwd.prepare_commit(transaction).map_err(|e| e.in_table(&self.name))?;
        self.num_rels.store(num_rels, Ordering::SeqCst);
        tracing::debug!(table = %self.name, rels = num_rels, "Committed rel table");
        Ok(fwd.max(bwd))
    }

    /// Checks every CSR header of both directions; returns the failing
    /// `(direction, node group)` pairs.
    pub fn sanity_check(&self) -> Result<Vec<(RelDirection, NodeGroupIdx)>> {
        let _guard = self.commit_lock.read();
        let mut failures = Vec::new();
        for data in [&self.fwd, &self.bwd] {
            for group in 0..data.num_node_groups() {
                if !data.sanity_check(group)? {
                    failures.push((data.direction(), group));
                }
            }
        }
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::{MemoryWal, WalRecord};
    use crate::transaction::TransactionType;
    use proptest::prelude::*;

    fn table(multiplicity: RelMultiplicity) -> (RelTable, Arc<MemoryWal>) {
        let config = StorageConfig::small();
        let bm = Arc::new(BufferManager::in_memory(config.page_size(), 256));
        let wal = Arc::new(MemoryWal::new());
        let table = RelTable::new(
            3,
            "follows",
            1,
            1,
            multiplicity,
            vec![("weight".to_string(), PhysicalType::Int64)],
            bm,
            Arc::clone(&wal) as Arc<dyn Wal>,
            config,
        );
        (table, wal)
    }

    fn writer(id: u64) -> Transaction {
        Transaction::new(id, TransactionType::Write)
    }

    fn reader() -> Transaction {
        Transaction::new(100, TransactionType::ReadOnly)
    }

    fn weight(v: i64) -> Vec<Option<Value>> {
        vec![Some(Value::Int64(v))]
    }

    #[test]
    fn test_insert_is_visible_in_both_directions_after_commit() {
        let (table, wal) = table(RelMultiplicity::ManyToMany);
        let mut txn = writer(1);
        let r1 = table.insert(&mut txn, 1, 2, &weight(10)).unwrap();
        let r2 = table.insert(&mut txn, 1, 1500, &weight(20)).unwrap();
        assert_ne!(r1, r2);
        assert_eq!(table.neighbors(&txn, RelDirection::Forward, 1).unwrap(), vec![2, 1500]);
        assert!(table.neighbors(&reader(), RelDirection::Forward, 1).unwrap().is_empty());

        assert_eq!(table.prepare_commit(&txn).unwrap(), CommitState::Persisted);
        assert_eq!(table.num_rels(), 2);
        assert_eq!(
            wal.records(),
            vec![
                WalRecord::UpdatedTable { table_id: 3 },
                WalRecord::TableStatistics { table_id: 3, num_rows: 2 },
            ]
        );

        let rows = table.scan(&reader(), RelDirection::Forward, 1, &[0]).unwrap();
        assert_eq!(
            rows,
            vec![
                RelRow { nbr: 2, rel_id: r1, properties: weight(10) },
                RelRow { nbr: 1500, rel_id: r2, properties: weight(20) },
            ]
        );
        // the second destination lives in node group 1 of the backward direction
        assert_eq!(table.neighbors(&reader(), RelDirection::Backward, 1500).unwrap(), vec![1]);
    }

    #[test]
    fn test_delete_reports_missing_and_repeated_edges() {
        let (table, _) = table(RelMultiplicity::ManyToMany);
        let mut txn = writer(1);
        let rel = table.insert(&mut txn, 4, 5, &weight(1)).unwrap();
        table.prepare_commit(&txn).unwrap();

        let mut txn = writer(2);
        assert!(!table.delete(&mut txn, 4, 5, rel + 1).unwrap());
        assert!(table.delete(&mut txn, 4, 5, rel).unwrap());
        assert!(!table.delete(&mut txn, 4, 5, rel).unwrap());
        assert!(table.neighbors(&txn, RelDirection::Backward, 5).unwrap().is_empty());
        table.prepare_commit(&txn).unwrap();

        assert!(table.scan(&reader(), RelDirection::Forward, 4, &[]).unwrap().is_empty());
        assert_eq!(table.num_rels(), 0);
    }

    #[test]
    fn test_update_then_rollback_leaves_data_untouched() {
        let (table, _) = table(RelMultiplicity::ManyToMany);
        let mut txn = writer(1);
        let rel = table.insert(&mut txn, 0, 9, &weight(1)).unwrap();
        table.prepare_commit(&txn).unwrap();
        let before = table.snapshot();

        let mut txn = writer(2);
        assert!(table.update(&mut txn, 0, 9, rel, 0, Some(Value::Int32(7))).unwrap());
        assert_eq!(table.scan(&txn, RelDirection::Backward, 9, &[0]).unwrap()[0].properties, weight(7));
        drop(txn);

        assert_eq!(table.snapshot(), before);
        assert_eq!(table.scan(&reader(), RelDirection::Forward, 0, &[0]).unwrap()[0].properties, weight(1));
    }

    #[test]
    fn test_update_is_committed_in_both_directions() {
        let (table, _) = table(RelMultiplicity::ManyToMany);
        let mut txn = writer(1);
        let rel = table.insert(&mut txn, 0, 9, &weight(1)).unwrap();
        table.prepare_commit(&txn).unwrap();

        let mut txn = writer(2);
        assert!(table.update(&mut txn, 0, 9, rel, 0, Some(Value::Int64(42))).unwrap());
        assert!(!table.update(&mut txn, 0, 9, rel + 5, 0, None).unwrap());
        assert!(matches!(
            table.update(&mut txn, 0, 9, rel, 3, None),
            Err(StorageError::PropertyNotFound { index: 3, .. })
        ));
        table.prepare_commit(&txn).unwrap();

        for (direction, node) in [(RelDirection::Forward, 0), (RelDirection::Backward, 9)] {
            assert_eq!(table.scan(&reader(), direction, node, &[0]).unwrap()[0].properties, weight(42));
        }
    }

    #[test]
    fn test_wrong_destination_is_rejected_before_staging() {
        for multiplicity in [RelMultiplicity::ManyToMany, RelMultiplicity::OneToMany] {
            let (table, _) = table(multiplicity);
            let mut txn = writer(1);
            let r0 = table.insert(&mut txn, 0, 1, &weight(1)).unwrap();
            let r1 = table.insert(&mut txn, 5, 2, &weight(2)).unwrap();
            table.prepare_commit(&txn).unwrap();

            let mut txn = writer(2);
            assert!(!table.delete(&mut txn, 0, 2, r0).unwrap());
            assert!(!table.update(&mut txn, 0, 2, r0, 0, Some(Value::Int64(9))).unwrap());
            assert!(!table.delete(&mut txn, 5, 1, r1).unwrap());
            let staged = table.insert(&mut txn, 3, 4, &weight(3)).unwrap();
            assert!(!table.delete(&mut txn, 3, 7, staged).unwrap());
            assert!(!table.update(&mut txn, 3, 7, staged, 0, None).unwrap());
            table.prepare_commit(&txn).unwrap();

            let reader = reader();
            assert_eq!(table.num_rels(), 3);
            assert_eq!(table.neighbors(&reader, RelDirection::Forward, 0).unwrap(), vec![1]);
            assert_eq!(table.neighbors(&reader, RelDirection::Forward, 5).unwrap(), vec![2]);
            assert_eq!(table.neighbors(&reader, RelDirection::Forward, 3).unwrap(), vec![4]);
            assert_eq!(table.neighbors(&reader, RelDirection::Backward, 1).unwrap(), vec![0]);
            assert_eq!(table.neighbors(&reader, RelDirection::Backward, 2).unwrap(), vec![5]);
            assert_eq!(table.scan(&reader, RelDirection::Forward, 0, &[0]).unwrap()[0].properties, weight(1));
            assert_eq!(table.scan(&reader, RelDirection::Forward, 3, &[0]).unwrap()[0].properties, weight(3));
            assert!(table.sanity_check().unwrap().is_empty());

            let mut txn = writer(3);
            assert!(table.delete(&mut txn, 0, 1, r0).unwrap());
            table.prepare_commit(&txn).unwrap();
            assert!(table.neighbors(&reader, RelDirection::Backward, 1).unwrap().is_empty());
            assert_eq!(table.neighbors(&reader, RelDirection::Backward, 2).unwrap(), vec![5]);
        }
    }

    #[test]
    fn test_single_multiplicity_rejects_second_edge() {
        let (table, _) = table(RelMultiplicity::OneToOne);
        let mut txn = writer(1);
        let rel = table.insert(&mut txn, 1, 2, &weight(1)).unwrap();
        assert!(matches!(
            table.insert(&mut txn, 1, 3, &weight(1)),
            Err(StorageError::MultiplicityViolation { offset: 1, .. })
        ));
        table.prepare_commit(&txn).unwrap();

        let mut txn = writer(2);
        assert!(table.delete(&mut txn, 1, 2, rel).unwrap());
        let replacement = table.insert(&mut txn, 1, 3, &weight(2)).unwrap();
        table.prepare_commit(&txn).unwrap();

        let rows = table.scan(&reader(), RelDirection::Forward, 1, &[0]).unwrap();
        assert_eq!(rows, vec![RelRow { nbr: 3, rel_id: replacement, properties: weight(2) }]);
        assert!(table.neighbors(&reader(), RelDirection::Backward, 2).unwrap().is_empty());
    }

    #[test]
    fn test_read_only_transaction_cannot_stage() {
        let (table, _) = table(RelMultiplicity::ManyToMany);
        let mut txn = Transaction::new(8, TransactionType::ReadOnly);
        assert!(matches!(
            table.insert(&mut txn, 1, 2, &weight(1)),
            Err(StorageError::ReadOnlyTransaction(8))
        ));
        assert!(matches!(
            table.insert(&mut writer(9), 1, 2, &[]),
            Err(StorageError::ArityMismatch { expected: 1, actual: 0, .. })
        ));
    }

    #[test]
    fn test_copy_from_lays_out_and_refuses_reload() {
        let (table, _) = table(RelMultiplicity::ManyToMany);
        let edges: Vec<_> = (0..300u64).map(|i| (i % 40, i % 7, weight(i as i64))).collect();
        table.copy_from(&edges).unwrap();

        assert_eq!(table.num_rels(), 300);
        assert!(table.sanity_check().unwrap().is_empty());
        let rows = table.scan(&reader(), RelDirection::Forward, 3, &[0]).unwrap();
        assert_eq!(rows.len(), 8);
        assert_eq!(rows[0], RelRow { nbr: 3, rel_id: 3, properties: weight(3) });
        assert_eq!(table.neighbors(&reader(), RelDirection::Backward, 6).unwrap().len(), 42);

        assert!(matches!(table.copy_from(&edges), Err(StorageError::TableNotEmpty(_))));
    }

    #[test]
    fn test_copy_from_checks_single_multiplicity() {
        let (table, _) = table(RelMultiplicity::ManyToOne);
        let edges = vec![(1, 2, weight(0)), (1, 3, weight(0))];
        assert!(matches!(
            table.copy_from(&edges),
            Err(StorageError::MultiplicityViolation { offset: 1, .. })
        ));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (table, wal) = table(RelMultiplicity::OneToMany);
        let mut txn = writer(1);
        table.insert(&mut txn, 7, 8, &weight(3)).unwrap();
        table.prepare_commit(&txn).unwrap();

        let config = StorageConfig::small();
        let bm = Arc::new(BufferManager::in_memory(config.page_size(), 16));
        let snapshot = table.snapshot();
        let bytes = bincode::serialize(&snapshot).unwrap();
        let decoded: RelTableSnapshot = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
        let reopened = RelTable::from_snapshot(decoded, bm, wal, config).unwrap();
        assert_eq!(reopened.num_rels(), 1);
        assert_eq!(reopened.multiplicity(), RelMultiplicity::OneToMany);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert { src: u64, dst: u64, weight: i64 },
        Delete { pick: usize },
        Update { pick: usize, weight: i64 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u64..150, 0u64..60, any::<i64>()).prop_map(|(src, dst, weight)| Op::Insert { src, dst, weight }),
            1 => any::<usize>().prop_map(|pick| Op::Delete { pick }),
            1 => (any::<usize>(), any::<i64>()).prop_map(|(pick, weight)| Op::Update { pick, weight }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_commits_match_model(batches in proptest::collection::vec(proptest::collection::vec(op(), 0..60), 1..5)) {
            let (table, _) = table(RelMultiplicity::ManyToMany);
            // rel id -> (src, dst, weight)
            let mut model: BTreeMap<RelId, (u64, u64, i64)> = BTreeMap::new();
            for (i, batch) in batches.iter().enumerate() {
                let mut txn = writer(i as u64 + 1);
                for op in batch {
                    match op {
                        Op::Insert { src, dst, weight: w } => {
                            let rel = table.insert(&mut txn, *src, *dst, &weight(*w)).unwrap();
                            model.insert(rel, (*src, *dst, *w));
                        }
                        Op::Delete { pick } if !model.is_empty() => {
                            let rel = *model.keys().nth(pick % model.len()).unwrap();
                            let (src, dst, _) = model.remove(&rel).unwrap();
                            prop_assert!(table.delete(&mut txn, src, dst, rel).unwrap());
                        }
                        Op::Update { pick, weight: w } if !model.is_empty() => {
                            let rel = *model.keys().nth(pick % model.len()).unwrap();
                            let entry = model.get_mut(&rel).unwrap();
                            prop_assert!(table.update(&mut txn, entry.0, entry.1, rel, 0, Some(Value::Int64(*w))).unwrap());
                            entry.2 = *w;
                        }
                        _ => {}
                    }
                }
                table.prepare_commit(&txn).unwrap();
                prop_assert!(table.sanity_check().unwrap().is_empty());
            }

            prop_assert_eq!(table.num_rels(), model.len() as u64);
            let reader = reader();
            for src in 0..150u64 {
                let mut expected: Vec<(u64, RelId, i64)> = model
                    .iter()
                    .filter(|(_, (s, _, _))| *s == src)
                    .map(|(rel, (_, dst, w))| (*dst, *rel, *w))
                    .collect();
                expected.sort_by_key(|e| e.1);
                let mut actual: Vec<(u64, RelId, i64)> = table
                    .scan(&reader, RelDirection::Forward, src, &[0])
                    .unwrap()
                    .into_iter()
                    .map(|row| (row.nbr, row.rel_id, row.properties[0].and_then(|v| v.as_i64()).unwrap()))
                    .collect();
                actual.sort_by_key(|e| e.1);
                prop_assert_eq!(actual, expected);
            }
            for dst in 0..60u64 {
                let mut expected: Vec<u64> = model.values().filter(|e| e.1 == dst).map(|e| e.0).collect();
                let mut actual = table.neighbors(&reader, RelDirection::Backward, dst).unwrap();
                expected.sort_unstable();
                actual.sort_unstable();
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
