//! Packed CSR layout of relationship node groups
//!
//! Every vertex of a CSR node group owns a run of slots `[start, end)` in the
//! node group's list space. The first `length` slots hold edges, the rest is
//! gap left for future insertions. The header keeps `start` and `length` per
//! vertex; `end` is the next vertex's start.
//!
//! Density is maintained over an implicit calibrator tree: level 0 covers
//! one leaf segment of vertices, every level above doubles the span, and the
//! level past the tree height is the whole node group.

pub mod header;
pub mod region;

pub use header::{compute_gap_from_length, CsrHeaderChunks, CsrHeaderColumns};
pub use region::{find_covering_region, find_regions, is_within_density_bound, PackedCsrInfo, PackedCsrRegion};
