//! Error types for the storage engine

use thiserror::Error;

use crate::storage::PhysicalType;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A value does not fit the physical width or compression range it is written into.
    #[error("Value {value} out of range for {data_type:?}")]
    OutOfRange { value: String, data_type: PhysicalType },

    #[error("Chunk capacity exceeded: need {required} rows, capacity is {capacity}")]
    CapacityExceeded { required: u64, capacity: u64 },

    #[error("Type mismatch: expected {expected:?}, got {actual:?}")]
    TypeMismatch { expected: PhysicalType, actual: PhysicalType },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Bulk load into non-empty table: {0}")]
    TableNotEmpty(String),

    #[error("Node {offset} already has an edge in single-multiplicity table {table}")]
    MultiplicityViolation { table: String, offset: u64 },

    #[error("Table {table} expects {expected} properties, got {actual}")]
    ArityMismatch { table: String, expected: usize, actual: usize },

    #[error("Node {offset} not found in table {table}")]
    NodeNotFound { table: String, offset: u64 },

    #[error("Property {index} not found in table {table}")]
    PropertyNotFound { table: String, index: usize },

    #[error("Transaction {0} is read-only")]
    ReadOnlyTransaction(u64),

    #[error("Another write transaction is already active")]
    WriteTransactionActive,

    #[error("Column {column}: {source}")]
    Column {
        column: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("Table {table}: {source}")]
    Table {
        table: String,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Wrap the error with the name of the column it was raised for.
    pub fn in_column(self, column: &str) -> Self {
        match self {
            // IO failures are propagated unchanged
            StorageError::Io(_) => self,
            other => StorageError::Column {
                column: column.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn in_table(self, table: &str) -> Self {
        match self {
            StorageError::Io(_) | StorageError::Table { .. } => self,
            other => StorageError::Table {
                table: table.to_string(),
                source: Box::new(other),
            },
        }
    }
}
