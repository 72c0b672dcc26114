//! On-disk column: one chunk per node group, located through an index-based metadata table
//!
//! Chunk layout on disk, starting at `page_idx`:
//! - `capacity * stored_width` bytes of encoded values
//! - `ceil(capacity / 8)` bytes of null bitmap (bit set = null)

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transaction::Transaction;
use super::column_chunk::ColumnChunk;
use super::compression::CompressionMetadata;
use super::pager::{BufferManager, PageIdx, INVALID_PAGE_IDX};
use super::vector::ValueVector;
use super::{NodeGroupIdx, Offset, PhysicalType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnChunkMetadata {
    pub page_idx: PageIdx,
    pub num_pages: u32,
    pub num_values: u64,
    /// Slots allocated on disk
    pub capacity: u64,
    pub compression: CompressionMetadata,
}

impl ColumnChunkMetadata {
    pub fn empty(data_type: PhysicalType) -> Self {
        Self {
            page_idx: INVALID_PAGE_IDX,
            num_pages: 0,
            num_values: 0,
            capacity: 0,
            compression: CompressionMetadata::uncompressed(data_type),
        }
    }

    fn values_bytes(&self) -> u64 {
        self.capacity * self.compression.stored_width() as u64
    }

    fn total_bytes(&self) -> u64 {
        self.values_bytes() + self.capacity.div_ceil(8)
    }
}

/// Persisted form of a column's metadata table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    pub name: String,
    pub data_type: PhysicalType,
    pub chunks: Vec<ColumnChunkMetadata>,
}

pub struct Column {
    name: String,
    data_type: PhysicalType,
    /// Upper bound on offsets within one node group; `None` for CSR list space.
    max_values_per_group: Option<u64>,
    enable_compression: bool,
    bm: Arc<BufferManager>,
    metadata: RwLock<Vec<ColumnChunkMetadata>>,
}

impl Column {
    pub fn new(
        name: impl Into<String>,
        data_type: PhysicalType,
        bm: Arc<BufferManager>,
        max_values_per_group: Option<u64>,
        enable_compression: bool,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            max_values_per_group,
            enable_compression,
            bm,
            metadata: RwLock::new(Vec::new()),
        }
    }

    pub fn from_snapshot(
        snapshot: ColumnSnapshot,
        bm: Arc<BufferManager>,
        max_values_per_group: Option<u64>,
        enable_compression: bool,
    ) -> Self {
        let column = Self::new(snapshot.name, snapshot.data_type, bm, max_values_per_group, enable_compression);
        *column.metadata.write() = snapshot.chunks;
        column
    }

    pub fn snapshot(&self) -> ColumnSnapshot {
        ColumnSnapshot {
            name: self.name.clone(),
            data_type: self.data_type,
            chunks: self.metadata.read().clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> PhysicalType {
        self.data_type
    }

    pub fn num_node_groups(&self) -> u64 {
        self.metadata.read().len() as u64
    }

    /// Metadata of a node group; groups never written read as empty.
    pub fn chunk_metadata(&self, node_group_idx: NodeGroupIdx) -> ColumnChunkMetadata {
        self.metadata
            .read()
            .get(node_group_idx as usize)
            .copied()
            .unwrap_or_else(|| ColumnChunkMetadata::empty(self.data_type))
    }

    pub fn num_values(&self, node_group_idx: NodeGroupIdx) -> u64 {
        self.chunk_metadata(node_group_idx).num_values
    }

    pub fn set_chunk_metadata(&self, node_group_idx: NodeGroupIdx, meta: ColumnChunkMetadata) {
        let mut metadata = self.metadata.write();
        let idx = node_group_idx as usize;
        if idx >= metadata.len() {
            metadata.resize(idx + 1, ColumnChunkMetadata::empty(self.data_type));
        }
        metadata[idx] = meta;
    }

    /// Copies rows `[start, end)` of a node group into `out` at `out_offset`.
    pub fn scan(
        &self,
        node_group_idx: NodeGroupIdx,
        start: Offset,
        end: Offset,
        out: &mut ValueVector,
        out_offset: usize,
    ) -> Result<()> {
        let chunk = self.scan_range(node_group_idx, start, end)?;
        chunk
            .scan(0, end - start, out, out_offset)
            .map_err(|e| e.in_column(&self.name))
    }

    /// Loads rows `[start, end)` into a fresh chunk sized to the range.
    pub fn scan_range(&self, node_group_idx: NodeGroupIdx, start: Offset, end: Offset) -> Result<ColumnChunk> {
        let mut chunk = ColumnChunk::new(self.data_type, end - start);
        self.scan_into_chunk(node_group_idx, start, end, &mut chunk, 0)?;
        Ok(chunk)
    }

    /// Loads the node group's whole chunk.
    pub fn scan_node_group(&self, node_group_idx: NodeGroupIdx) -> Result<ColumnChunk> {
        let num_values = self.num_values(node_group_idx);
        self.scan_range(node_group_idx, 0, num_values)
    }

    /// Loads rows `[start, end)` into `chunk` at `dst_offset`. Rows past the stored data read as null.
    pub fn scan_into_chunk(
        &self,
        node_group_idx: NodeGroupIdx,
        start: Offset,
        end: Offset,
        chunk: &mut ColumnChunk,
        dst_offset: u64,
    ) -> Result<()> {
        let meta = self.chunk_metadata(node_group_idx);
        self.read_into(&meta, start, end, chunk, dst_offset)
    }

    pub fn lookup(&self, node_group_idx: NodeGroupIdx, pos: Offset) -> Result<Option<Value>> {
        let chunk = self.scan_range(node_group_idx, pos, pos + 1)?;
        Ok(chunk.get_value(0))
    }

    /// Initial write of a node group's chunk. Each node group is appended once.
    pub fn append(&self, chunk: &ColumnChunk, node_group_idx: NodeGroupIdx) -> Result<()> {
        let existing = self.metadata.read().len() as u64;
        assert!(
            node_group_idx >= existing,
            "node group {} of column {} already appended",
            node_group_idx,
            self.name
        );
        let meta = self.write_chunk(chunk)?;
        self.set_chunk_metadata(node_group_idx, meta);
        Ok(())
    }

    /// Writes `chunk` to freshly allocated pages without publishing it.
    pub fn write_chunk(&self, chunk: &ColumnChunk) -> Result<ColumnChunkMetadata> {
        assert_eq!(chunk.data_type(), self.data_type, "chunk type does not match column {}", self.name);
        let capacity = chunk.num_values();
        let mut meta = ColumnChunkMetadata {
            page_idx: INVALID_PAGE_IDX,
            num_pages: 0,
            num_values: capacity,
            capacity,
            compression: chunk.compression_metadata(self.enable_compression),
        };
        let total = meta.total_bytes();
        if total == 0 {
            return Ok(meta);
        }
        let num_pages = total.div_ceil(self.bm.page_size() as u64) as u32;
        meta.page_idx = self.bm.allocate_pages(num_pages);
        meta.num_pages = num_pages;

        let width = meta.compression.stored_width();
        let values_bytes = meta.values_bytes() as usize;
        let mut buf = vec![0u8; total as usize];
        for pos in 0..capacity {
            let p = pos as usize;
            if chunk.is_null(pos) {
                buf[values_bytes + p / 8] |= 1 << (p % 8);
                continue;
            }
            meta.compression
                .encode(self.data_type, chunk.raw(pos), &mut buf[p * width..(p + 1) * width])
                .map_err(|e| e.in_column(&self.name))?;
        }
        self.write_bytes(&meta, 0, &buf)?;
        Ok(meta)
    }

    /// Writes `chunk` out of place, then swaps the metadata entry.
    pub fn replace_chunk(&self, node_group_idx: NodeGroupIdx, chunk: &ColumnChunk) -> Result<()> {
        let meta = self.write_chunk(chunk)?;
        self.set_chunk_metadata(node_group_idx, meta);
        Ok(())
    }

    /// Writes `chunk[src_offset + i]` to `dst_offsets[i]` within the node group.
    ///
    /// Writes that fit the existing chunk (allocated slot, representable under
    /// its compression) go in place through pinned pages. Anything else reads the
    /// whole chunk, applies the writes in memory and rewrites it to new pages.
    pub fn prepare_commit_for_chunk(
        &self,
        transaction: &Transaction,
        node_group_idx: NodeGroupIdx,
        dst_offsets: &[Offset],
        chunk: &ColumnChunk,
        src_offset: u64,
    ) -> Result<()> {
        assert!(
            transaction.is_write_transaction(),
            "commit of column {} from read-only transaction {}",
            self.name,
            transaction.id()
        );
        assert_eq!(chunk.data_type(), self.data_type, "chunk type does not match column {}", self.name);
        let Some(&max_dst) = dst_offsets.iter().max() else {
            return Ok(());
        };
        if let Some(limit) = self.max_values_per_group {
            assert!(
                max_dst < limit,
                "write at offset {} beyond node group capacity {} of column {}",
                max_dst,
                limit,
                self.name
            );
        }

        let meta = self.chunk_metadata(node_group_idx);
        let in_place = max_dst < meta.capacity
            && (0..dst_offsets.len()).all(|i| {
                let src = src_offset + i as u64;
                chunk.is_null(src) || meta.compression.can_store(self.data_type, chunk.raw(src))
            });

        if in_place {
            for (i, dst) in dst_offsets.iter().enumerate() {
                self.write_value(&meta, *dst, chunk, src_offset + i as u64)?;
            }
            return Ok(());
        }

        let num_values = meta.num_values.max(max_dst + 1);
        let mut full = ColumnChunk::new(self.data_type, num_values);
        self.read_into(&meta, 0, meta.num_values, &mut full, 0)?;
        for (i, dst) in dst_offsets.iter().enumerate() {
            full.copy(chunk, src_offset + i as u64, *dst, 1);
        }
        full.set_num_values(num_values);
        self.replace_chunk(node_group_idx, &full)?;
        tracing::debug!(
            column = %self.name,
            node_group = node_group_idx,
            num_values,
            "Rewrote column chunk out of place"
        );
        Ok(())
    }

    fn read_into(
        &self,
        meta: &ColumnChunkMetadata,
        start: Offset,
        end: Offset,
        chunk: &mut ColumnChunk,
        dst_offset: u64,
    ) -> Result<()> {
        let stored_end = end.min(meta.capacity);
        if start < stored_end {
            let count = (stored_end - start) as usize;
            let width = meta.compression.stored_width();
            let mut stored = vec![0u8; count * width];
            if width > 0 {
                self.read_bytes(meta, start * width as u64, &mut stored)?;
            }
            let first_null_byte = start / 8;
            let last_null_byte = (stored_end - 1) / 8;
            let mut null_bytes = vec![0u8; (last_null_byte - first_null_byte + 1) as usize];
            self.read_bytes(meta, meta.values_bytes() + first_null_byte, &mut null_bytes)?;

            let native_width = self.data_type.width();
            let mut native = [0u8; 8];
            for i in 0..count {
                let bit = (start - first_null_byte * 8) as usize + i;
                let null = null_bytes[bit / 8] & (1 << (bit % 8)) != 0;
                meta.compression.decode(
                    self.data_type,
                    &stored[i * width..(i + 1) * width],
                    &mut native[..native_width],
                );
                chunk.set_raw(dst_offset + i as u64, &native[..native_width], null);
            }
        }
        for pos in stored_end.max(start)..end {
            chunk.set_value(dst_offset + pos - start, None)?;
        }
        Ok(())
    }

    fn write_value(&self, meta: &ColumnChunkMetadata, pos: Offset, chunk: &ColumnChunk, src: u64) -> Result<()> {
        let null = chunk.is_null(src);
        let width = meta.compression.stored_width();
        if width > 0 && !null {
            let mut stored = [0u8; 8];
            meta.compression
                .encode(self.data_type, chunk.raw(src), &mut stored[..width])
                .map_err(|e| e.in_column(&self.name))?;
            self.write_bytes(meta, pos * width as u64, &stored[..width])?;
        }
        let byte = meta.values_bytes() + pos / 8;
        let page_size = self.bm.page_size() as u64;
        let guard = self.bm.pin(meta.page_idx + (byte / page_size) as u32)?;
        let in_page = (byte % page_size) as usize;
        let bit = 1u8 << (pos % 8);
        guard.write(|data| {
            if null {
                data[in_page] |= bit;
            } else {
                data[in_page] &= !bit;
            }
        });
        Ok(())
    }

    fn read_bytes(&self, meta: &ColumnChunkMetadata, offset: u64, out: &mut [u8]) -> Result<()> {
        let page_size = self.bm.page_size() as u64;
        let mut done = 0usize;
        while done < out.len() {
            let pos = offset + done as u64;
            let in_page = (pos % page_size) as usize;
            let n = (page_size as usize - in_page).min(out.len() - done);
            let guard = self.bm.pin(meta.page_idx + (pos / page_size) as u32)?;
            guard.read(|data| out[done..done + n].copy_from_slice(&data[in_page..in_page + n]));
            done += n;
        }
        Ok(())
    }

    fn write_bytes(&self, meta: &ColumnChunkMetadata, offset: u64, bytes: &[u8]) -> Result<()> {
        let page_size = self.bm.page_size() as u64;
        let mut done = 0usize;
        while done < bytes.len() {
            let pos = offset + done as u64;
            let in_page = (pos % page_size) as usize;
            let n = (page_size as usize - in_page).min(bytes.len() - done);
            let guard = self.bm.pin(meta.page_idx + (pos / page_size) as u32)?;
            guard.write(|data| data[in_page..in_page + n].copy_from_slice(&bytes[done..done + n]));
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CompressionType;
    use crate::transaction::{Transaction, TransactionType};

    fn write_txn() -> Transaction {
        Transaction::new(1, TransactionType::Write)
    }

    fn column(data_type: PhysicalType, max: Option<u64>, compression: bool) -> Column {
        let bm = Arc::new(BufferManager::in_memory(512, 64));
        Column::new("c", data_type, bm, max, compression)
    }

    fn u64_chunk(values: &[u64]) -> ColumnChunk {
        let values: Vec<_> = values.iter().map(|v| Some(Value::UInt64(*v))).collect();
        ColumnChunk::from_values(PhysicalType::UInt64, &values).unwrap()
    }

    #[test]
    fn test_append_and_scan_across_pages() {
        let col = column(PhysicalType::UInt64, None, false);
        let values: Vec<u64> = (0..200).map(|i| i * 3).collect();
        col.append(&u64_chunk(&values), 0).unwrap();

        let meta = col.chunk_metadata(0);
        assert_eq!(meta.num_values, 200);
        assert!(meta.num_pages >= 4);

        let chunk = col.scan_range(0, 60, 130).unwrap();
        assert_eq!(chunk.num_values(), 70);
        assert_eq!(chunk.get_u64(0), 180);
        assert_eq!(chunk.get_u64(69), 129 * 3);

        let mut out = ValueVector::new(PhysicalType::UInt64, 8);
        col.scan(0, 198, 200, &mut out, 2).unwrap();
        assert_eq!(out.get_value(3), Some(Value::UInt64(199 * 3)));
    }

    #[test]
    fn test_nulls_and_compression_survive() {
        let col = column(PhysicalType::Int64, None, true);
        let chunk = ColumnChunk::from_values(
            PhysicalType::Int64,
            &[Some(Value::Int64(1000)), None, Some(Value::Int64(1010))],
        )
        .unwrap();
        col.append(&chunk, 0).unwrap();
        assert_eq!(col.chunk_metadata(0).compression.kind, CompressionType::IntegerPacking);

        assert_eq!(col.lookup(0, 0).unwrap(), Some(Value::Int64(1000)));
        assert_eq!(col.lookup(0, 1).unwrap(), None);
        assert_eq!(col.lookup(0, 2).unwrap(), Some(Value::Int64(1010)));
        // past the stored data
        assert_eq!(col.lookup(0, 5).unwrap(), None);
    }

    #[test]
    fn test_in_place_commit_keeps_pages() {
        let col = column(PhysicalType::UInt64, None, true);
        col.append(&u64_chunk(&[10, 11, 12, 13]), 0).unwrap();
        let before = col.chunk_metadata(0);

        col.prepare_commit_for_chunk(&write_txn(), 0, &[3, 0], &u64_chunk(&[20, 15]), 0)
            .unwrap();

        assert_eq!(col.chunk_metadata(0).page_idx, before.page_idx);
        let all = col.scan_node_group(0).unwrap();
        assert_eq!(all.values().collect::<Vec<_>>(), u64_chunk(&[15, 11, 12, 20]).values().collect::<Vec<_>>());
    }

    #[test]
    fn test_out_of_range_value_rewrites_chunk() {
        let col = column(PhysicalType::UInt64, None, true);
        col.append(&u64_chunk(&[10, 11, 12]), 0).unwrap();
        let before = col.chunk_metadata(0);

        col.prepare_commit_for_chunk(&write_txn(), 0, &[1], &u64_chunk(&[1 << 40]), 0)
            .unwrap();

        let after = col.chunk_metadata(0);
        assert_ne!(after.page_idx, before.page_idx);
        assert_eq!(col.lookup(0, 0).unwrap(), Some(Value::UInt64(10)));
        assert_eq!(col.lookup(0, 1).unwrap(), Some(Value::UInt64(1 << 40)));
    }

    #[test]
    fn test_commit_grows_list_space_and_new_node_groups() {
        let col = column(PhysicalType::UInt64, None, true);
        col.prepare_commit_for_chunk(&write_txn(), 2, &[4], &u64_chunk(&[7]), 0)
            .unwrap();
        assert_eq!(col.num_node_groups(), 3);
        assert_eq!(col.num_values(0), 0);
        assert_eq!(col.num_values(2), 5);
        assert_eq!(col.lookup(2, 4).unwrap(), Some(Value::UInt64(7)));
        assert_eq!(col.lookup(2, 3).unwrap(), None);
    }

    #[test]
    #[should_panic(expected = "beyond node group capacity")]
    fn test_write_past_node_group_capacity_asserts() {
        let col = column(PhysicalType::UInt64, Some(16), true);
        let _ = col.prepare_commit_for_chunk(&write_txn(), 0, &[16], &u64_chunk(&[1]), 0);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn test_read_only_commit_asserts() {
        let col = column(PhysicalType::UInt64, None, true);
        let txn = Transaction::new(2, TransactionType::ReadOnly);
        let _ = col.prepare_commit_for_chunk(&txn, 0, &[0], &u64_chunk(&[1]), 0);
    }

    #[test]
    fn test_snapshot_restores_metadata() {
        let bm = Arc::new(BufferManager::in_memory(512, 64));
        let col = Column::new("weight", PhysicalType::UInt64, Arc::clone(&bm), None, true);
        col.append(&u64_chunk(&[5, 6]), 0).unwrap();

        let restored = Column::from_snapshot(col.snapshot(), bm, None, true);
        assert_eq!(restored.name(), "weight");
        assert_eq!(restored.lookup(0, 1).unwrap(), Some(Value::UInt64(6)));
    }
}
