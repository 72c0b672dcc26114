//! Database facade and graph traversals

pub mod engine;
pub mod traversal;

pub use engine::{normalize_db_path, Database};
pub use traversal::{bfs, dfs};
