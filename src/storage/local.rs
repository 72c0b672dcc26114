//! Transaction-local deltas
//!
//! A write transaction stages its changes here and nothing touches persistent
//! columns until commit. Rolling back is dropping the [`LocalStorage`].
//!
//! Relationship deltas are kept per node group. Values live in append-only
//! [`LocalVectorCollection`]s; the info maps only record which row of those
//! collections belongs to which `(vertex, rel id)`.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use super::column_chunk::ColumnChunk;
use super::rel_table_data::{RelDataFormat, RelDirection, REL_ID_COLUMN_ID};
use super::{ColumnId, NodeGroupIdx, Offset, PhysicalType, RelId, RowIdx, TableId, Value};

/// Append-only value store addressed by row index, grown in fixed-size batches.
#[derive(Debug, Clone)]
pub struct LocalVectorCollection {
    data_type: PhysicalType,
    batch_capacity: u64,
    batches: Vec<ColumnChunk>,
    num_rows: u64,
}

impl LocalVectorCollection {
    pub fn new(data_type: PhysicalType, batch_capacity: u64) -> Self {
        Self {
            data_type,
            batch_capacity,
            batches: Vec::new(),
            num_rows: 0,
        }
    }

    pub fn data_type(&self) -> PhysicalType {
        self.data_type
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn append(&mut self, value: Option<Value>) -> Result<RowIdx> {
        let value = value.map(|v| v.cast(self.data_type)).transpose()?;
        let row = self.num_rows;
        let batch_idx = (row / self.batch_capacity) as usize;
        if batch_idx == self.batches.len() {
            self.batches.push(ColumnChunk::new(self.data_type, self.batch_capacity));
        }
        self.batches[batch_idx].append_value(value)?;
        self.num_rows += 1;
        Ok(row)
    }

    pub fn get(&self, row: RowIdx) -> Option<Value> {
        assert!(row < self.num_rows, "local row {} out of {}", row, self.num_rows);
        self.batches[(row / self.batch_capacity) as usize].get_value(row % self.batch_capacity)
    }
}

/// Local deltas of a CSR-format node group, keyed by `(vertex, rel id)`.
#[derive(Debug, Clone, Default)]
pub struct CsrRelNgInfo {
    adj_insert_info: BTreeMap<Offset, BTreeMap<RelId, RowIdx>>,
    insert_info_per_column: Vec<BTreeMap<Offset, BTreeMap<RelId, RowIdx>>>,
    update_info_per_column: Vec<BTreeMap<Offset, BTreeMap<RelId, RowIdx>>>,
    delete_info: BTreeMap<Offset, BTreeSet<RelId>>,
}

impl CsrRelNgInfo {
    pub fn new(num_columns: usize) -> Self {
        Self {
            adj_insert_info: BTreeMap::new(),
            insert_info_per_column: vec![BTreeMap::new(); num_columns],
            update_info_per_column: vec![BTreeMap::new(); num_columns],
            delete_info: BTreeMap::new(),
        }
    }

    /// Records a new edge. Rel ids are unique per vertex; a repeat is a caller bug.
    pub fn insert(&mut self, offset: Offset, rel_id: RelId, adj_row: RowIdx, column_rows: &[RowIdx]) {
        let rels = self.adj_insert_info.entry(offset).or_default();
        assert!(
            !rels.contains_key(&rel_id),
            "rel {} inserted twice for vertex {}",
            rel_id,
            offset
        );
        rels.insert(rel_id, adj_row);
        for (info, row) in self.insert_info_per_column.iter_mut().zip(column_rows) {
            info.entry(offset).or_default().insert(rel_id, *row);
        }
    }

    /// Points `column_id` of the edge at a new local row. Updates of deleted
    /// edges are dropped and reported as `false`.
    pub fn update(&mut self, offset: Offset, rel_id: RelId, column_id: ColumnId, row: RowIdx) -> bool {
        if self.is_deleted(offset, rel_id) {
            return false;
        }
        let inserted = self
            .adj_insert_info
            .get(&offset)
            .is_some_and(|rels| rels.contains_key(&rel_id));
        let info = if inserted {
            &mut self.insert_info_per_column[column_id]
        } else {
            &mut self.update_info_per_column[column_id]
        };
        info.entry(offset).or_default().insert(rel_id, row);
        true
    }

    /// Removes a local insert outright, tombstones a persistent edge, and
    /// returns `false` when the edge was already deleted.
    ///
    /// Persistence is not checked here: callers must have found `rel_id`
    /// stored at `offset`, or commit underflows the vertex's list length.
    pub fn delete(&mut self, offset: Offset, rel_id: RelId) -> bool {
        if remove_nested(&mut self.adj_insert_info, offset, rel_id) {
            for info in &mut self.insert_info_per_column {
                remove_nested(info, offset, rel_id);
            }
            return true;
        }
        if self.is_deleted(offset, rel_id) {
            return false;
        }
        for info in &mut self.update_info_per_column {
            remove_nested(info, offset, rel_id);
        }
        self.delete_info.entry(offset).or_default().insert(rel_id);
        true
    }

    pub fn is_deleted(&self, offset: Offset, rel_id: RelId) -> bool {
        self.delete_info
            .get(&offset)
            .is_some_and(|rels| rels.contains(&rel_id))
    }

    pub fn adj_insert_info(&self) -> &BTreeMap<Offset, BTreeMap<RelId, RowIdx>> {
        &self.adj_insert_info
    }

    pub fn insert_info(&self, column_id: ColumnId) -> &BTreeMap<Offset, BTreeMap<RelId, RowIdx>> {
        &self.insert_info_per_column[column_id]
    }

    pub fn update_info(&self, column_id: ColumnId) -> &BTreeMap<Offset, BTreeMap<RelId, RowIdx>> {
        &self.update_info_per_column[column_id]
    }

    pub fn delete_info(&self) -> &BTreeMap<Offset, BTreeSet<RelId>> {
        &self.delete_info
    }

    pub fn num_insertions(&self, offset: Offset) -> u64 {
        self.adj_insert_info.get(&offset).map_or(0, |rels| rels.len() as u64)
    }

    pub fn num_deletions(&self, offset: Offset) -> u64 {
        self.delete_info.get(&offset).map_or(0, |rels| rels.len() as u64)
    }

    pub fn has_updates(&self, offset: Offset) -> bool {
        self.update_info_per_column.iter().any(|info| info.contains_key(&offset))
    }

    /// Updated local row of a persistent edge's column, if any.
    pub fn updated_row(&self, column_id: ColumnId, offset: Offset, rel_id: RelId) -> Option<RowIdx> {
        self.update_info_per_column[column_id]
            .get(&offset)
            .and_then(|rels| rels.get(&rel_id))
            .copied()
    }

    /// Every vertex with a pending insert, update or delete.
    pub fn touched_offsets(&self) -> BTreeSet<Offset> {
        let mut offsets: BTreeSet<Offset> = self.adj_insert_info.keys().copied().collect();
        offsets.extend(self.delete_info.keys().copied());
        for info in &self.update_info_per_column {
            offsets.extend(info.keys().copied());
        }
        offsets
    }

    pub fn is_empty(&self) -> bool {
        self.adj_insert_info.is_empty()
            && self.delete_info.is_empty()
            && self.update_info_per_column.iter().all(|info| info.is_empty())
    }
}

fn remove_nested<V>(map: &mut BTreeMap<Offset, BTreeMap<RelId, V>>, offset: Offset, rel_id: RelId) -> bool {
    let Some(rels) = map.get_mut(&offset) else {
        return false;
    };
    let removed = rels.remove(&rel_id).is_some();
    if rels.is_empty() {
        map.remove(&offset);
    }
    removed
}

/// Local deltas of a regular-format node group: at most one edge per vertex.
#[derive(Debug, Clone, Default)]
pub struct RegularRelNgInfo {
    adj_insert_info: BTreeMap<Offset, RowIdx>,
    insert_info_per_column: Vec<BTreeMap<Offset, RowIdx>>,
    update_info_per_column: Vec<BTreeMap<Offset, RowIdx>>,
    delete_info: BTreeSet<Offset>,
}

impl RegularRelNgInfo {
    pub fn new(num_columns: usize) -> Self {
        Self {
            adj_insert_info: BTreeMap::new(),
            insert_info_per_column: vec![BTreeMap::new(); num_columns],
            update_info_per_column: vec![BTreeMap::new(); num_columns],
            delete_info: BTreeSet::new(),
        }
    }

    /// A later insert replaces whatever the vertex held before.
    pub fn insert(&mut self, offset: Offset, adj_row: RowIdx, column_rows: &[RowIdx]) {
        self.adj_insert_info.insert(offset, adj_row);
        for (info, row) in self.insert_info_per_column.iter_mut().zip(column_rows) {
            info.insert(offset, *row);
        }
        for info in &mut self.update_info_per_column {
            info.remove(&offset);
        }
    }

    pub fn update(&mut self, offset: Offset, column_id: ColumnId, row: RowIdx) -> bool {
        if self.adj_insert_info.contains_key(&offset) {
            self.insert_info_per_column[column_id].insert(offset, row);
            return true;
        }
        if self.delete_info.contains(&offset) {
            return false;
        }
        self.update_info_per_column[column_id].insert(offset, row);
        true
    }

    pub fn delete(&mut self, offset: Offset) -> bool {
        if self.adj_insert_info.remove(&offset).is_some() {
            for info in &mut self.insert_info_per_column {
                info.remove(&offset);
            }
            return true;
        }
        for info in &mut self.update_info_per_column {
            info.remove(&offset);
        }
        self.delete_info.insert(offset)
    }

    /// Whether the persistent edge of `offset` is hidden by a local delete.
    pub fn is_deleted(&self, offset: Offset) -> bool {
        !self.adj_insert_info.contains_key(&offset) && self.delete_info.contains(&offset)
    }

    /// Whether reads must skip the persistent edge of `offset`: it is either
    /// deleted or replaced by a local insert.
    pub fn hides_persistent(&self, offset: Offset) -> bool {
        self.adj_insert_info.contains_key(&offset) || self.delete_info.contains(&offset)
    }

    pub fn adj_insert_info(&self) -> &BTreeMap<Offset, RowIdx> {
        &self.adj_insert_info
    }

    pub fn insert_info(&self, column_id: ColumnId) -> &BTreeMap<Offset, RowIdx> {
        &self.insert_info_per_column[column_id]
    }

    pub fn update_info(&self, column_id: ColumnId) -> &BTreeMap<Offset, RowIdx> {
        &self.update_info_per_column[column_id]
    }

    pub fn delete_info(&self) -> &BTreeSet<Offset> {
        &self.delete_info
    }

    pub fn is_empty(&self) -> bool {
        self.adj_insert_info.is_empty()
            && self.delete_info.is_empty()
            && self.update_info_per_column.iter().all(|info| info.is_empty())
    }
}

#[derive(Debug, Clone)]
pub enum RelNgInfo {
    Regular(RegularRelNgInfo),
    Csr(CsrRelNgInfo),
}

impl RelNgInfo {
    pub fn new(format: RelDataFormat, num_columns: usize) -> Self {
        match format {
            RelDataFormat::Regular => RelNgInfo::Regular(RegularRelNgInfo::new(num_columns)),
            RelDataFormat::Csr => RelNgInfo::Csr(CsrRelNgInfo::new(num_columns)),
        }
    }

    pub fn insert(&mut self, offset: Offset, rel_id: RelId, adj_row: RowIdx, column_rows: &[RowIdx]) {
        match self {
            RelNgInfo::Regular(info) => info.insert(offset, adj_row, column_rows),
            RelNgInfo::Csr(info) => info.insert(offset, rel_id, adj_row, column_rows),
        }
    }

    pub fn update(&mut self, offset: Offset, rel_id: RelId, column_id: ColumnId, row: RowIdx) -> bool {
        match self {
            RelNgInfo::Regular(info) => info.update(offset, column_id, row),
            RelNgInfo::Csr(info) => info.update(offset, rel_id, column_id, row),
        }
    }

    pub fn delete(&mut self, offset: Offset, rel_id: RelId) -> bool {
        match self {
            RelNgInfo::Regular(info) => info.delete(offset),
            RelNgInfo::Csr(info) => info.delete(offset, rel_id),
        }
    }

    pub fn is_deleted(&self, offset: Offset, rel_id: RelId) -> bool {
        match self {
            RelNgInfo::Regular(info) => info.is_deleted(offset),
            RelNgInfo::Csr(info) => info.is_deleted(offset, rel_id),
        }
    }

    pub fn hides_persistent(&self, offset: Offset, rel_id: RelId) -> bool {
        match self {
            RelNgInfo::Regular(info) => info.hides_persistent(offset),
            RelNgInfo::Csr(info) => info.is_deleted(offset, rel_id),
        }
    }

    /// Local row holding the updated `column_id` value of a persistent edge.
    pub fn updated_row(&self, column_id: ColumnId, offset: Offset, rel_id: RelId) -> Option<RowIdx> {
        match self {
            RelNgInfo::Regular(info) => info.update_info(column_id).get(&offset).copied(),
            RelNgInfo::Csr(info) => info.updated_row(column_id, offset, rel_id),
        }
    }

    /// Local rows `(adj row, row per column)` of the edges inserted at `offset`.
    pub fn local_inserts(&self, offset: Offset) -> Vec<(RowIdx, Vec<RowIdx>)> {
        match self {
            RelNgInfo::Regular(info) => info
                .adj_insert_info()
                .get(&offset)
                .map(|adj_row| {
                    let rows = info
                        .insert_info_per_column
                        .iter()
                        .map(|column| column[&offset])
                        .collect();
                    vec![(*adj_row, rows)]
                })
                .unwrap_or_default(),
            RelNgInfo::Csr(info) => info
                .adj_insert_info()
                .get(&offset)
                .map(|rels| {
                    rels.iter()
                        .map(|(rel_id, adj_row)| {
                            let rows = info
                                .insert_info_per_column
                                .iter()
                                .map(|column| column[&offset][rel_id])
                                .collect();
                            (*adj_row, rows)
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RelNgInfo::Regular(info) => info.is_empty(),
            RelNgInfo::Csr(info) => info.is_empty(),
        }
    }

    /// Edges gained minus edges lost once this delta is committed.
    pub fn net_size_change(&self) -> i64 {
        match self {
            RelNgInfo::Regular(info) => info.adj_insert_info().len() as i64 - info.delete_info().len() as i64,
            RelNgInfo::Csr(info) => {
                let inserted: usize = info.adj_insert_info().values().map(|rels| rels.len()).sum();
                let deleted: usize = info.delete_info().values().map(|rels| rels.len()).sum();
                inserted as i64 - deleted as i64
            }
        }
    }
}

/// Staged edges and edits of one node group in one direction.
#[derive(Debug, Clone)]
pub struct LocalRelNg {
    info: RelNgInfo,
    adj: LocalVectorCollection,
    columns: Vec<LocalVectorCollection>,
}

impl LocalRelNg {
    /// `column_types` starts with the rel id column.
    pub fn new(format: RelDataFormat, column_types: &[PhysicalType], batch_capacity: u64) -> Self {
        Self {
            info: RelNgInfo::new(format, column_types.len()),
            adj: LocalVectorCollection::new(PhysicalType::UInt64, batch_capacity),
            columns: column_types
                .iter()
                .map(|ty| LocalVectorCollection::new(*ty, batch_capacity))
                .collect(),
        }
    }

    /// Stages an edge from `offset` to `nbr`. `properties` exclude the rel id.
    pub fn insert(&mut self, offset: Offset, nbr: Offset, rel_id: RelId, properties: &[Option<Value>]) -> Result<()> {
        assert_eq!(
            properties.len() + 1,
            self.columns.len(),
            "property count does not match rel table columns"
        );
        let values = std::iter::once(Some(Value::UInt64(rel_id)))
            .chain(properties.iter().copied())
            .zip(&self.columns)
            .map(|(value, column)| value.map(|v| v.cast(column.data_type())).transpose())
            .collect::<Result<Vec<_>>>()?;

        let adj_row = self.adj.append(Some(Value::UInt64(nbr)))?;
        let rows = values
            .into_iter()
            .zip(&mut self.columns)
            .map(|(value, column)| column.append(value))
            .collect::<Result<Vec<_>>>()?;
        self.info.insert(offset, rel_id, adj_row, &rows);
        Ok(())
    }

    /// Stages a property update; `Ok(false)` when the edge is locally deleted.
    pub fn update(&mut self, offset: Offset, rel_id: RelId, column_id: ColumnId, value: Option<Value>) -> Result<bool> {
        assert_ne!(column_id, REL_ID_COLUMN_ID, "rel ids are immutable");
        if self.info.is_deleted(offset, rel_id) {
            return Ok(false);
        }
        let row = self.columns[column_id].append(value)?;
        Ok(self.info.update(offset, rel_id, column_id, row))
    }

    /// Stages a delete; see [`CsrRelNgInfo::delete`]. The caller must have
    /// checked that the edge exists at `offset`.
    pub fn delete(&mut self, offset: Offset, rel_id: RelId) -> bool {
        self.info.delete(offset, rel_id)
    }

    pub fn info(&self) -> &RelNgInfo {
        &self.info
    }

    pub fn adj(&self) -> &LocalVectorCollection {
        &self.adj
    }

    pub fn column(&self, column_id: ColumnId) -> &LocalVectorCollection {
        &self.columns[column_id]
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

/// Local node groups of one direction of a rel table.
#[derive(Debug, Clone)]
pub struct LocalRelTableData {
    format: RelDataFormat,
    column_types: Vec<PhysicalType>,
    batch_capacity: u64,
    node_groups: BTreeMap<NodeGroupIdx, LocalRelNg>,
}

impl LocalRelTableData {
    pub fn new(format: RelDataFormat, column_types: Vec<PhysicalType>, batch_capacity: u64) -> Self {
        Self {
            format,
            column_types,
            batch_capacity,
            node_groups: BTreeMap::new(),
        }
    }

    pub fn format(&self) -> RelDataFormat {
        self.format
    }

    pub fn get(&self, node_group_idx: NodeGroupIdx) -> Option<&LocalRelNg> {
        self.node_groups.get(&node_group_idx)
    }

    pub fn get_or_create(&mut self, node_group_idx: NodeGroupIdx) -> &mut LocalRelNg {
        let (format, batch_capacity) = (self.format, self.batch_capacity);
        let column_types = &self.column_types;
        self.node_groups
            .entry(node_group_idx)
            .or_insert_with(|| LocalRelNg::new(format, column_types, batch_capacity))
    }

    pub fn node_groups(&self) -> impl Iterator<Item = (&NodeGroupIdx, &LocalRelNg)> {
        self.node_groups.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.node_groups.values().all(|ng| ng.info().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct LocalRelTable {
    pub fwd: LocalRelTableData,
    pub bwd: LocalRelTableData,
}

impl LocalRelTable {
    pub fn direction(&self, direction: RelDirection) -> &LocalRelTableData {
        match direction {
            RelDirection::Forward => &self.fwd,
            RelDirection::Backward => &self.bwd,
        }
    }

    pub fn direction_mut(&mut self, direction: RelDirection) -> &mut LocalRelTableData {
        match direction {
            RelDirection::Forward => &mut self.fwd,
            RelDirection::Backward => &mut self.bwd,
        }
    }
}

/// Staged rows and edits of a node table. Offsets of new rows are fixed at
/// insert time: the committed row count plus the local row index.
#[derive(Debug, Clone, Default)]
pub struct LocalNodeTable {
    start_offset: Offset,
    inserted: Vec<Vec<Option<Value>>>,
    updates: BTreeMap<(Offset, ColumnId), Option<Value>>,
    deletes: BTreeSet<Offset>,
}

impl LocalNodeTable {
    pub fn new(start_offset: Offset) -> Self {
        Self {
            start_offset,
            ..Self::default()
        }
    }

    pub fn start_offset(&self) -> Offset {
        self.start_offset
    }

    pub fn insert(&mut self, values: Vec<Option<Value>>) -> Offset {
        self.inserted.push(values);
        self.start_offset + self.inserted.len() as u64 - 1
    }

    pub fn is_local(&self, offset: Offset) -> bool {
        offset >= self.start_offset && offset < self.start_offset + self.inserted.len() as u64
    }

    pub fn update(&mut self, offset: Offset, column_id: ColumnId, value: Option<Value>) {
        if self.is_local(offset) {
            self.inserted[(offset - self.start_offset) as usize][column_id] = value;
        } else {
            self.updates.insert((offset, column_id), value);
        }
    }

    /// `false` if the row was already deleted in this transaction.
    pub fn delete(&mut self, offset: Offset) -> bool {
        self.updates.retain(|(o, _), _| *o != offset);
        self.deletes.insert(offset)
    }

    pub fn is_deleted(&self, offset: Offset) -> bool {
        self.deletes.contains(&offset)
    }

    /// Locally staged value of a cell: `Some` when this transaction wrote it.
    pub fn get(&self, offset: Offset, column_id: ColumnId) -> Option<Option<Value>> {
        if self.is_local(offset) {
            return Some(self.inserted[(offset - self.start_offset) as usize][column_id]);
        }
        self.updates.get(&(offset, column_id)).copied()
    }

    pub fn inserted_rows(&self) -> &[Vec<Option<Value>>] {
        &self.inserted
    }

    pub fn updates(&self) -> &BTreeMap<(Offset, ColumnId), Option<Value>> {
        &self.updates
    }

    pub fn deletes(&self) -> &BTreeSet<Offset> {
        &self.deletes
    }
}

/// Everything a write transaction has staged, per table.
#[derive(Debug, Default)]
pub struct LocalStorage {
    node_tables: BTreeMap<TableId, LocalNodeTable>,
    rel_tables: BTreeMap<TableId, LocalRelTable>,
}

impl LocalStorage {
    pub fn node_table(&self, table_id: TableId) -> Option<&LocalNodeTable> {
        self.node_tables.get(&table_id)
    }

    pub fn node_table_or_insert_with(
        &mut self,
        table_id: TableId,
        create: impl FnOnce() -> LocalNodeTable,
    ) -> &mut LocalNodeTable {
        self.node_tables.entry(table_id).or_insert_with(create)
    }

    pub fn rel_table(&self, table_id: TableId) -> Option<&LocalRelTable> {
        self.rel_tables.get(&table_id)
    }

    pub fn rel_table_or_insert_with(
        &mut self,
        table_id: TableId,
        create: impl FnOnce() -> LocalRelTable,
    ) -> &mut LocalRelTable {
        self.rel_tables.entry(table_id).or_insert_with(create)
    }

    pub fn is_empty(&self) -> bool {
        self.node_tables.is_empty() && self.rel_tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.node_tables.clear();
        self.rel_tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csr_ng() -> LocalRelNg {
        LocalRelNg::new(RelDataFormat::Csr, &[PhysicalType::UInt64, PhysicalType::Int64], 4)
    }

    fn props(v: i64) -> Vec<Option<Value>> {
        vec![Some(Value::Int64(v))]
    }

    #[test]
    fn test_vector_collection_spans_batches() {
        let mut collection = LocalVectorCollection::new(PhysicalType::Int32, 2);
        for v in 0..5 {
            assert_eq!(collection.append(Some(Value::Int64(v))).unwrap(), v as u64);
        }
        collection.append(None).unwrap();
        assert_eq!(collection.num_rows(), 6);
        assert_eq!(collection.get(4), Some(Value::Int32(4)));
        assert_eq!(collection.get(5), None);
    }

    #[test]
    fn test_vector_collection_rejects_out_of_range() {
        let mut collection = LocalVectorCollection::new(PhysicalType::Int32, 2);
        assert!(collection.append(Some(Value::Int64(i64::MAX))).is_err());
        assert_eq!(collection.num_rows(), 0);
    }

    #[test]
    #[should_panic(expected = "inserted twice")]
    fn test_csr_duplicate_insert_panics() {
        let mut ng = csr_ng();
        ng.insert(3, 10, 7, &props(1)).unwrap();
        ng.insert(3, 11, 7, &props(2)).unwrap();
    }

    #[test]
    fn test_csr_delete_of_local_insert_leaves_no_tombstone() {
        let mut ng = csr_ng();
        ng.insert(3, 10, 7, &props(1)).unwrap();
        assert!(ng.delete(3, 7));

        let RelNgInfo::Csr(info) = ng.info() else { panic!("csr info expected") };
        assert!(info.adj_insert_info().is_empty());
        assert!(info.delete_info().is_empty());
        assert!(info.is_empty());
    }

    #[test]
    fn test_csr_double_delete_reports_false() {
        let mut ng = csr_ng();
        // rel 1 stands for a persistent edge the caller has already found at vertex 3
        assert!(ng.delete(3, 1));
        assert!(!ng.delete(3, 1));
        assert!(!ng.update(3, 1, 1, Some(Value::Int64(5))).unwrap());
    }

    #[test]
    fn test_csr_update_of_local_insert_replaces_insert_row() {
        let mut ng = csr_ng();
        ng.insert(3, 10, 7, &props(1)).unwrap();
        assert!(ng.update(3, 7, 1, Some(Value::Int64(99))).unwrap());

        let RelNgInfo::Csr(info) = ng.info() else { panic!("csr info expected") };
        let row = info.insert_info(1)[&3][&7];
        assert_eq!(ng.column(1).get(row), Some(Value::Int64(99)));
        assert!(info.update_info(1).is_empty());
    }

    #[test]
    fn test_csr_delete_drops_pending_updates() {
        let mut ng = csr_ng();
        ng.update(5, 2, 1, Some(Value::Int64(4))).unwrap();
        assert!(ng.delete(5, 2));

        let RelNgInfo::Csr(info) = ng.info() else { panic!("csr info expected") };
        assert!(info.update_info(1).is_empty());
        assert_eq!(info.num_deletions(5), 1);
        assert_eq!(info.touched_offsets().into_iter().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn test_regular_later_insert_wins() {
        let mut ng = LocalRelNg::new(RelDataFormat::Regular, &[PhysicalType::UInt64, PhysicalType::Int64], 4);
        assert!(ng.delete(2, 1));
        assert!(ng.info().is_deleted(2, 1));
        ng.insert(2, 8, 5, &props(1)).unwrap();
        ng.insert(2, 9, 6, &props(2)).unwrap();
        assert!(!ng.info().is_deleted(2, 6));

        let RelNgInfo::Regular(info) = ng.info() else { panic!("regular info expected") };
        assert_eq!(ng.adj().get(info.adj_insert_info()[&2]), Some(Value::UInt64(9)));
        // dropping the insert uncovers the earlier delete
        assert!(ng.delete(2, 6));
        assert!(ng.info().is_deleted(2, 6));
    }

    #[test]
    fn test_local_node_table_offsets_and_edits() {
        let mut table = LocalNodeTable::new(10);
        assert_eq!(table.insert(vec![Some(Value::Int64(1))]), 10);
        assert_eq!(table.insert(vec![Some(Value::Int64(2))]), 11);

        table.update(11, 0, Some(Value::Int64(20)));
        table.update(3, 0, None);
        assert_eq!(table.get(11, 0), Some(Some(Value::Int64(20))));
        assert_eq!(table.get(3, 0), Some(None));
        assert_eq!(table.get(4, 0), None);

        assert!(table.delete(3));
        assert!(!table.delete(3));
        assert!(table.updates().is_empty());
    }
}
