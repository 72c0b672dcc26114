//! ngdb - embedded property-graph storage engine
//!
//! # Architecture
//!
//! - **Node groups**: tables are split into fixed-size vertical slices, one
//!   compressed column chunk per property
//! - **Packed CSR**: relationships are stored per direction as CSR regions
//!   with gaps, rebalanced through a calibrator tree on commit
//! - **Local storage**: a write transaction stages its changes and sees them
//!   merged over committed data until commit
//! - **Checkpoint**: node groups are compacted, pages flushed and the table
//!   metadata rewritten in one checksummed file
//!
//! # Usage example
//!
//! ```no_run
//! use ngdb::{Database, PhysicalType, RelDirection, RelMultiplicity, StorageConfig, Value};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::create("./social.ngdb", StorageConfig::default())?;
//! let person = db.create_node_table("person", vec![("age".into(), PhysicalType::Int64)])?;
//! let knows = db.create_rel_table("knows", "person", "person", RelMultiplicity::ManyToMany, Vec::new())?;
//!
//! let mut txn = db.begin_write_transaction()?;
//! let alice = person.insert(&mut txn, &[Some(Value::Int64(31))])?;
//! let bob = person.insert(&mut txn, &[Some(Value::Int64(27))])?;
//! knows.insert(&mut txn, alice, bob, &[])?;
//! db.commit(txn)?;
//!
//! let reader = db.begin_read_transaction();
//! let reachable = db.bfs(&reader, "knows", RelDirection::Forward, &[alice], 3)?;
//! println!("Reached {} people", reachable.len());
//! db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod storage;
pub mod transaction;

pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use graph::Database;
pub use storage::{
    CommitState, NodeTable, Offset, PhysicalType, RelDirection, RelId, RelMultiplicity, RelRow, RelTable, TableId,
    Value,
};
pub use transaction::{Transaction, TransactionType};
