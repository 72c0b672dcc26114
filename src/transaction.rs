//! Transaction context and the single-writer transaction manager

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::storage::LocalStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ReadOnly,
    Write,
}

/// A transaction and the uncommitted changes it owns.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    kind: TransactionType,
    local_storage: LocalStorage,
}

impl Transaction {
    pub fn new(id: u64, kind: TransactionType) -> Self {
        Self {
            id,
            kind,
            local_storage: LocalStorage::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransactionType {
        self.kind
    }

    pub fn is_read_only(&self) -> bool {
        self.kind == TransactionType::ReadOnly
    }

    pub fn is_write_transaction(&self) -> bool {
        self.kind == TransactionType::Write
    }

    pub fn ensure_write(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnlyTransaction(self.id));
        }
        Ok(())
    }

    pub fn local_storage(&self) -> &LocalStorage {
        &self.local_storage
    }

    pub fn local_storage_mut(&mut self) -> &mut LocalStorage {
        &mut self.local_storage
    }
}

pub struct TransactionManager {
    next_id: AtomicU64,
    active_writer: Mutex<Option<u64>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active_writer: Mutex::new(None),
        }
    }

    pub fn begin_read(&self) -> Transaction {
        Transaction::new(self.next_id.fetch_add(1, Ordering::Relaxed), TransactionType::ReadOnly)
    }

    pub fn begin_write(&self) -> Result<Transaction> {
        let mut writer = self.active_writer.lock();
        if writer.is_some() {
            return Err(StorageError::WriteTransactionActive);
        }
        let txn = Transaction::new(self.next_id.fetch_add(1, Ordering::Relaxed), TransactionType::Write);
        *writer = Some(txn.id());
        Ok(txn)
    }

    /// Releases the writer slot held by `transaction`, if any.
    pub fn finish(&self, transaction: &Transaction) {
        let mut writer = self.active_writer.lock();
        if *writer == Some(transaction.id()) {
            *writer = None;
        }
    }

    pub fn has_active_writer(&self) -> bool {
        self.active_writer.lock().is_some()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_writer() {
        let manager = TransactionManager::new();
        let writer = manager.begin_write().unwrap();
        assert!(matches!(manager.begin_write(), Err(StorageError::WriteTransactionActive)));

        let reader = manager.begin_read();
        assert!(reader.is_read_only());
        assert!(reader.id() > writer.id());

        manager.finish(&reader);
        assert!(manager.has_active_writer());
        manager.finish(&writer);
        assert!(manager.begin_write().is_ok());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let txn = Transaction::new(5, TransactionType::ReadOnly);
        assert!(matches!(txn.ensure_write(), Err(StorageError::ReadOnlyTransaction(5))));
    }
}
