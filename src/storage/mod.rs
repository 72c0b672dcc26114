//! Node-group columnar storage with packed-CSR relationship tables

pub mod types;
pub mod vector;
pub mod pager;
pub mod wal;
pub mod compression;
pub mod column_chunk;
pub mod column;
pub mod node_group;
pub mod node_table;
pub mod csr;
pub mod local;
pub mod rel_table_data;
pub mod rel_table;
pub mod metadata;

pub use types::{PhysicalType, Value};
pub use vector::{NullMask, SelectionVector, ValueVector};
pub use pager::{BufferManager, DiskPageFile, MemoryPageFile, PageFile, PageGuard, PageIdx};
pub use wal::{FileWal, MemoryWal, Wal, WalRecord};
pub use compression::{CompressionMetadata, CompressionType};
pub use column_chunk::ColumnChunk;
pub use column::{Column, ColumnChunkMetadata};
pub use node_group::{ChunkedNodeGroup, NodeGroup, NodeGroupCollection, NodeGroupScanState};
pub use node_table::NodeTable;
pub use csr::{CsrHeaderChunks, CsrHeaderColumns, PackedCsrInfo, PackedCsrRegion};
pub use local::{LocalRelNg, LocalRelTableData, LocalStorage, RelNgInfo};
pub use rel_table_data::{CommitState, RelDataFormat, RelDataReadState, RelDirection, RelTableData};
pub use rel_table::{RelMultiplicity, RelRow, RelTable};

/// Row offset, either global within a table or local within a node group
pub type Offset = u64;
pub type NodeGroupIdx = u64;
/// Row index inside a node group or a local vector collection
pub type RowIdx = u64;
pub type ColumnId = usize;
pub type RelId = u64;
pub type TableId = u64;

/// Splits a global offset into `(node group index, offset within the group)`.
pub fn split_offset(offset: Offset, node_group_size_log2: u32) -> (NodeGroupIdx, Offset) {
    (
        offset >> node_group_size_log2,
        offset & ((1u64 << node_group_size_log2) - 1),
    )
}
