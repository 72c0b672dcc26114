//! Database facade: table catalog, transactions, commit and checkpoint
//!
//! A file-backed database is a directory holding `config.json`,
//! `data.pages`, `wal.log` and `metadata.bin`. Committed relationship data
//! is written into pages at commit time; `metadata.bin` only changes at
//! checkpoint, so reopening a database shows its last checkpoint.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::storage::metadata::{read_metadata, write_metadata, DatabaseMetadata};
use crate::storage::{
    BufferManager, DiskPageFile, FileWal, MemoryWal, NodeTable, Offset, PhysicalType, RelDirection,
    RelMultiplicity, RelTable, TableId, Wal, WalRecord,
};
use crate::transaction::{Transaction, TransactionManager};
use super::traversal;

pub const CONFIG_FILE: &str = "config.json";
pub const PAGES_FILE: &str = "data.pages";
pub const WAL_FILE: &str = "wal.log";
pub const METADATA_FILE: &str = "metadata.bin";

/// Normalize database path ensuring the `.ngdb` extension
///
/// - `/path/to/db` -> `/path/to/db.ngdb`
/// - `/path/to/db.db` -> `/path/to/db.ngdb`
/// - `/path/to/db.ngdb` stays as is
pub fn normalize_db_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if path.extension().and_then(|s| s.to_str()) == Some("ngdb") {
        return path.to_path_buf();
    }
    path.with_extension("ngdb")
}

#[derive(Default)]
struct Catalog {
    next_table_id: TableId,
    node_tables: BTreeMap<TableId, Arc<NodeTable>>,
    rel_tables: BTreeMap<TableId, Arc<RelTable>>,
}

impl Catalog {
    fn contains_name(&self, name: &str) -> bool {
        self.node_tables.values().any(|t| t.name() == name) || self.rel_tables.values().any(|t| t.name() == name)
    }

    fn node_table(&self, name: &str) -> Option<&Arc<NodeTable>> {
        self.node_tables.values().find(|t| t.name() == name)
    }

    fn rel_table(&self, name: &str) -> Option<&Arc<RelTable>> {
        self.rel_tables.values().find(|t| t.name() == name)
    }

    fn next_id(&mut self) -> TableId {
        let id = self.next_table_id;
        self.next_table_id += 1;
        id
    }
}

pub struct Database {
    /// `None` for in-memory databases
    path: Option<PathBuf>,
    config: StorageConfig,
    bm: Arc<BufferManager>,
    wal: Arc<dyn Wal>,
    transactions: TransactionManager,
    catalog: RwLock<Catalog>,
    /// Serializes commits against checkpoints
    commit_lock: Mutex<()>,
}

impl Database {
    /// Creates a new empty database directory.
    pub fn create<P: AsRef<Path>>(path: P, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let path = normalize_db_path(path);
        if path.join(CONFIG_FILE).exists() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("database already exists at {}", path.display()),
            )));
        }
        fs::create_dir_all(&path)?;
        config.save(path.join(CONFIG_FILE))?;

        let pages = DiskPageFile::open(path.join(PAGES_FILE), config.page_size())?;
        let bm = Arc::new(BufferManager::new(Box::new(pages), config.buffer_pool_pages));
        let wal: Arc<dyn Wal> = Arc::new(FileWal::open(path.join(WAL_FILE))?);
        let db = Self::with_parts(Some(path), config, bm, wal, Catalog::default());
        db.write_metadata()?;

        tracing::info!(path = ?db.path, "Created database");
        Ok(db)
    }

    /// Opens an existing database at its last checkpoint.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = normalize_db_path(path);
        let config = StorageConfig::load(path.join(CONFIG_FILE))?;
        let metadata = read_metadata(&path.join(METADATA_FILE))?;

        let wal_path = path.join(WAL_FILE);
        if wal_path.exists() {
            let pending = FileWal::read_records(&wal_path)?;
            let commits = pending
                .iter()
                .filter(|r| matches!(r, WalRecord::Commit { .. }))
                .count();
            if commits > 0 {
                tracing::warn!(
                    commits,
                    records = pending.len(),
                    "WAL holds commits past the last checkpoint; they are not replayed"
                );
            }
        }

        let pages = DiskPageFile::open(path.join(PAGES_FILE), config.page_size())?;
        let bm = Arc::new(BufferManager::new(Box::new(pages), config.buffer_pool_pages));
        let wal: Arc<dyn Wal> = Arc::new(FileWal::open(&wal_path)?);
        let catalog = Self::load_catalog(metadata, &bm, &wal, config)?;
        let db = Self::with_parts(Some(path), config, bm, wal, catalog);

        {
            let catalog = db.catalog.read();
            tracing::info!(
                path = ?db.path,
                node_tables = catalog.node_tables.len(),
                rel_tables = catalog.rel_tables.len(),
                "Opened database"
            );
        }
        Ok(db)
    }

    /// A database backed by memory pages and an in-memory WAL.
    pub fn in_memory(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let bm = Arc::new(BufferManager::in_memory(config.page_size(), config.buffer_pool_pages));
        let wal: Arc<dyn Wal> = Arc::new(MemoryWal::new());
        Ok(Self::with_parts(None, config, bm, wal, Catalog::default()))
    }

    fn with_parts(
        path: Option<PathBuf>,
        config: StorageConfig,
        bm: Arc<BufferManager>,
        wal: Arc<dyn Wal>,
        catalog: Catalog,
    ) -> Self {
        Self {
            path,
            config,
            bm,
            wal,
            transactions: TransactionManager::new(),
            catalog: RwLock::new(catalog),
            commit_lock: Mutex::new(()),
        }
    }

    fn load_catalog(
        metadata: DatabaseMetadata,
        bm: &Arc<BufferManager>,
        wal: &Arc<dyn Wal>,
        config: StorageConfig,
    ) -> Result<Catalog> {
        let mut catalog = Catalog {
            next_table_id: metadata.next_table_id,
            ..Catalog::default()
        };
        for snapshot in metadata.node_tables {
            let table = NodeTable::from_snapshot(snapshot, Arc::clone(bm), Arc::clone(wal), config);
            catalog.node_tables.insert(table.table_id(), Arc::new(table));
        }
        for snapshot in metadata.rel_tables {
            let table = RelTable::from_snapshot(snapshot, Arc::clone(bm), Arc::clone(wal), config)?;
            catalog.rel_tables.insert(table.table_id(), Arc::new(table));
        }
        Ok(catalog)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.bm
    }

    pub fn create_node_table(&self, name: &str, properties: Vec<(String, PhysicalType)>) -> Result<Arc<NodeTable>> {
        let mut catalog = self.catalog.write();
        if catalog.contains_name(name) {
            return Err(StorageError::TableExists(name.to_string()));
        }
        let table_id = catalog.next_id();
        let table = Arc::new(NodeTable::new(
            table_id,
            name,
            properties,
            Arc::clone(&self.bm),
            Arc::clone(&self.wal),
            self.config,
        ));
        catalog.node_tables.insert(table_id, Arc::clone(&table));
        tracing::info!(table = name, table_id, "Created node table");
        Ok(table)
    }

    /// Creates a relationship table between two existing node tables.
    pub fn create_rel_table(
        &self,
        name: &str,
        src_table: &str,
        dst_table: &str,
        multiplicity: RelMultiplicity,
        properties: Vec<(String, PhysicalType)>,
    ) -> Result<Arc<RelTable>> {
        let mut catalog = self.catalog.write();
        if catalog.contains_name(name) {
            return Err(StorageError::TableExists(name.to_string()));
        }
        let src = catalog
            .node_table(src_table)
            .map(|t| t.table_id())
            .ok_or_else(|| StorageError::TableNotFound(src_table.to_string()))?;
        let dst = catalog
            .node_table(dst_table)
            .map(|t| t.table_id())
            .ok_or_else(|| StorageError::TableNotFound(dst_table.to_string()))?;
        let table_id = catalog.next_id();
        let table = Arc::new(RelTable::new(
            table_id,
            name,
            src,
            dst,
            multiplicity,
            properties,
            Arc::clone(&self.bm),
            Arc::clone(&self.wal),
            self.config,
        ));
        catalog.rel_tables.insert(table_id, Arc::clone(&table));
        tracing::info!(table = name, table_id, src = src_table, dst = dst_table, "Created rel table");
        Ok(table)
    }

    pub fn node_table(&self, name: &str) -> Result<Arc<NodeTable>> {
        self.catalog
            .read()
            .node_table(name)
            .cloned()
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    pub fn rel_table(&self, name: &str) -> Result<Arc<RelTable>> {
        self.catalog
            .read()
            .rel_table(name)
            .cloned()
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    /// Node tables in creation order.
    pub fn node_tables(&self) -> Vec<Arc<NodeTable>> {
        self.catalog.read().node_tables.values().cloned().collect()
    }

    /// Rel tables in creation order.
    pub fn rel_tables(&self) -> Vec<Arc<RelTable>> {
        self.catalog.read().rel_tables.values().cloned().collect()
    }

    pub fn begin_read_transaction(&self) -> Transaction {
        self.transactions.begin_read()
    }

    /// Fails with `WriteTransactionActive` while another writer is open.
    pub fn begin_write_transaction(&self) -> Result<Transaction> {
        self.transactions.begin_write()
    }

    /// Applies the transaction's local changes. The writer slot is released
    /// whether or not the commit succeeds.
    pub fn commit(&self, transaction: Transaction) -> Result<()> {
        let result = if transaction.is_write_transaction() {
            self.commit_write(&transaction)
        } else {
            Ok(())
        };
        self.transactions.finish(&transaction);
        if let Err(e) = &result {
            tracing::warn!(transaction = transaction.id(), error = %e, "Commit failed");
        }
        result
    }

    fn commit_write(&self, transaction: &Transaction) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let (node_tables, rel_tables) = {
            let catalog = self.catalog.read();
            (
                catalog.node_tables.values().cloned().collect::<Vec<_>>(),
                catalog.rel_tables.values().cloned().collect::<Vec<_>>(),
            )
        };
        for table in &node_tables {
            table.prepare_commit(transaction)?;
        }
        for table in &rel_tables {
            table.prepare_commit(transaction)?;
        }
        self.wal.log_commit(transaction.id())?;
        tracing::debug!(transaction = transaction.id(), "Committed");
        Ok(())
    }

    /// Discards the transaction's local changes.
    pub fn rollback(&self, transaction: Transaction) {
        self.transactions.finish(&transaction);
        tracing::debug!(transaction = transaction.id(), "Rolled back");
    }

    /// Persists node groups, flushes dirty pages and rewrites `metadata.bin`,
    /// after which the WAL is truncated.
    pub fn checkpoint(&self) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let node_tables = self.node_tables();
        let mut rewritten = 0;
        for table in &node_tables {
            rewritten += table.checkpoint()?;
        }
        self.bm.flush_all()?;
        self.write_metadata()?;
        self.wal.log_checkpoint()?;
        self.wal.clear()?;
        tracing::info!(node_groups = rewritten, pages = self.bm.num_pages(), "Checkpoint complete");
        Ok(())
    }

    fn write_metadata(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let metadata = {
            let catalog = self.catalog.read();
            DatabaseMetadata {
                next_table_id: catalog.next_table_id,
                node_tables: catalog.node_tables.values().map(|t| t.snapshot()).collect(),
                rel_tables: catalog.rel_tables.values().map(|t| t.snapshot()).collect(),
            }
        };
        write_metadata(&path.join(METADATA_FILE), &metadata)
    }

    /// Checkpoints and drops the database.
    pub fn close(self) -> Result<()> {
        self.checkpoint()
    }

    /// Nodes reachable from `start` through `rel_table` within `max_depth` hops.
    pub fn bfs(
        &self,
        transaction: &Transaction,
        rel_table: &str,
        direction: RelDirection,
        start: &[Offset],
        max_depth: usize,
    ) -> Result<Vec<Offset>> {
        let table = self.rel_table(rel_table)?;
        traversal::bfs(start, max_depth, |node| table.neighbors(transaction, direction, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Value;
    use tempfile::tempdir;

    fn person_props() -> Vec<(String, PhysicalType)> {
        vec![("age".to_string(), PhysicalType::Int64)]
    }

    fn knows_props() -> Vec<(String, PhysicalType)> {
        vec![("since".to_string(), PhysicalType::Int64)]
    }

    /// `count` people with a `knows` chain `0 -> 1 -> ... -> count - 1`.
    fn populate(db: &Database, count: u64) {
        let people = db.create_node_table("person", person_props()).unwrap();
        let knows = db
            .create_rel_table("knows", "person", "person", RelMultiplicity::ManyToMany, knows_props())
            .unwrap();
        let mut txn = db.begin_write_transaction().unwrap();
        for i in 0..count {
            people.insert(&mut txn, &[Some(Value::Int64(i as i64))]).unwrap();
        }
        for i in 1..count {
            knows
                .insert(&mut txn, i - 1, i, &[Some(Value::Int64(2000 + i as i64))])
                .unwrap();
        }
        db.commit(txn).unwrap();
    }

    #[test]
    fn test_normalize_db_path() {
        assert_eq!(normalize_db_path("/path/to/db"), PathBuf::from("/path/to/db.ngdb"));
        assert_eq!(normalize_db_path("/path/to/db.ngdb"), PathBuf::from("/path/to/db.ngdb"));
        assert_eq!(normalize_db_path("/path/to/db.db"), PathBuf::from("/path/to/db.ngdb"));
        assert_eq!(normalize_db_path("mydb"), PathBuf::from("mydb.ngdb"));
        assert_eq!(normalize_db_path("mydb.sqlite"), PathBuf::from("mydb.ngdb"));
    }

    #[test]
    fn test_create_lays_out_directory() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("graph"), StorageConfig::small()).unwrap();
        let path = db.path().unwrap().to_path_buf();
        assert!(path.ends_with("graph.ngdb"));
        for file in [CONFIG_FILE, PAGES_FILE, WAL_FILE, METADATA_FILE] {
            assert!(path.join(file).exists(), "missing {}", file);
        }
        drop(db);

        let again = Database::create(dir.path().join("graph"), StorageConfig::small());
        assert!(matches!(again, Err(StorageError::Io(_))));
    }

    #[test]
    fn test_catalog_errors() {
        let db = Database::in_memory(StorageConfig::small()).unwrap();
        db.create_node_table("person", person_props()).unwrap();
        assert!(matches!(
            db.create_node_table("person", Vec::new()),
            Err(StorageError::TableExists(_))
        ));
        assert!(matches!(
            db.create_rel_table("knows", "person", "city", RelMultiplicity::ManyToMany, Vec::new()),
            Err(StorageError::TableNotFound(_))
        ));
        assert!(matches!(db.rel_table("knows"), Err(StorageError::TableNotFound(_))));
        assert!(matches!(db.node_table("city"), Err(StorageError::TableNotFound(_))));
    }

    #[test]
    fn test_single_writer() {
        let db = Database::in_memory(StorageConfig::small()).unwrap();
        let writer = db.begin_write_transaction().unwrap();
        assert!(matches!(
            db.begin_write_transaction(),
            Err(StorageError::WriteTransactionActive)
        ));
        let reader = db.begin_read_transaction();
        db.commit(reader).unwrap();
        db.rollback(writer);

        let writer = db.begin_write_transaction().unwrap();
        db.commit(writer).unwrap();
        db.begin_write_transaction().unwrap();
    }

    #[test]
    fn test_rollback_discards_changes() {
        let db = Database::in_memory(StorageConfig::small()).unwrap();
        populate(&db, 4);
        let people = db.node_table("person").unwrap();
        let knows = db.rel_table("knows").unwrap();

        let mut txn = db.begin_write_transaction().unwrap();
        let offset = people.insert(&mut txn, &[Some(Value::Int64(99))]).unwrap();
        knows.insert(&mut txn, 3, offset, &[None]).unwrap();
        assert_eq!(knows.neighbors(&txn, RelDirection::Forward, 3).unwrap(), vec![offset]);
        db.rollback(txn);

        let reader = db.begin_read_transaction();
        assert_eq!(people.num_rows(), 4);
        assert!(!people.exists(&reader, offset).unwrap());
        assert!(knows.neighbors(&reader, RelDirection::Forward, 3).unwrap().is_empty());
        assert_eq!(knows.num_rels(), 3);
    }

    #[test]
    fn test_bfs_follows_committed_edges() {
        let db = Database::in_memory(StorageConfig::small()).unwrap();
        populate(&db, 6);
        let reader = db.begin_read_transaction();
        assert_eq!(
            db.bfs(&reader, "knows", RelDirection::Forward, &[0], 3).unwrap(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(
            db.bfs(&reader, "knows", RelDirection::Backward, &[5], 10).unwrap(),
            vec![5, 4, 3, 2, 1, 0]
        );
        assert!(matches!(
            db.bfs(&reader, "likes", RelDirection::Forward, &[0], 1),
            Err(StorageError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_commit_and_checkpoint_touch_wal() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("wal"), StorageConfig::small()).unwrap();
        let wal_path = db.path().unwrap().join(WAL_FILE);
        populate(&db, 3);

        let records = FileWal::read_records(&wal_path).unwrap();
        assert!(records.iter().any(|r| matches!(r, WalRecord::Commit { .. })));
        assert!(records.contains(&WalRecord::TableStatistics { table_id: 1, num_rows: 2 }));

        db.checkpoint().unwrap();
        assert!(FileWal::read_records(&wal_path).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_after_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("social");
        {
            let db = Database::create(&path, StorageConfig::small()).unwrap();
            populate(&db, 50);
            let knows = db.rel_table("knows").unwrap();
            let mut txn = db.begin_write_transaction().unwrap();
            knows.insert(&mut txn, 0, 49, &[Some(Value::Int64(1999))]).unwrap();
            db.commit(txn).unwrap();
            db.close().unwrap();
        }

        let db = Database::open(path.with_extension("ngdb")).unwrap();
        let people = db.node_table("person").unwrap();
        let knows = db.rel_table("knows").unwrap();
        assert_eq!(people.num_rows(), 50);
        assert_eq!(knows.num_rels(), 50);

        let reader = db.begin_read_transaction();
        assert_eq!(people.lookup(&reader, 42, 0).unwrap(), Some(Value::Int64(42)));
        let mut out = knows.neighbors(&reader, RelDirection::Forward, 0).unwrap();
        out.sort_unstable();
        assert_eq!(out, vec![1, 49]);
        let rows = knows.scan(&reader, RelDirection::Backward, 10, &[0]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].nbr, 9);
        assert_eq!(rows[0].properties, vec![Some(Value::Int64(2010))]);
        assert!(knows.sanity_check().unwrap().is_empty());

        // New tables get fresh ids after reopen
        let city = db.create_node_table("city", Vec::new()).unwrap();
        assert_eq!(city.table_id(), 2);
    }

    #[test]
    fn test_open_rejects_corrupt_metadata() {
        let dir = tempdir().unwrap();
        let path = {
            let db = Database::create(dir.path().join("broken"), StorageConfig::small()).unwrap();
            populate(&db, 5);
            let path = db.path().unwrap().to_path_buf();
            db.close().unwrap();
            path
        };
        let metadata_path = path.join(METADATA_FILE);
        let mut bytes = fs::read(&metadata_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        fs::write(&metadata_path, bytes).unwrap();
        assert!(matches!(Database::open(&path), Err(StorageError::InvalidFormat(_))));
    }
}
