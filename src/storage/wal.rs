//! Write-ahead log hook
//!
//! The storage core only appends records; replay is not implemented.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use super::TableId;

/// Record appended to the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    TableStatistics { table_id: TableId, num_rows: u64 },
    UpdatedTable { table_id: TableId },
    Commit { transaction_id: u64 },
    Checkpoint,
}

pub trait Wal: Send + Sync {
    fn append(&self, record: WalRecord) -> Result<()>;

    fn sync(&self) -> Result<()>;

    /// Drops every record, called once a checkpoint made them redundant.
    fn clear(&self) -> Result<()>;

    fn log_table_statistics(&self, table_id: TableId, num_rows: u64) -> Result<()> {
        self.append(WalRecord::TableStatistics { table_id, num_rows })
    }

    fn add_to_updated_tables(&self, table_id: TableId) -> Result<()> {
        self.append(WalRecord::UpdatedTable { table_id })
    }

    fn log_commit(&self, transaction_id: u64) -> Result<()> {
        self.append(WalRecord::Commit { transaction_id })?;
        self.sync()
    }

    fn log_checkpoint(&self) -> Result<()> {
        self.append(WalRecord::Checkpoint)?;
        self.sync()
    }
}

/// Length-prefixed bincode frames in `wal.log`.
pub struct FileWal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileWal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back every complete frame. A torn trailing frame is ignored.
    pub fn read_records<P: AsRef<Path>>(path: P) -> Result<Vec<WalRecord>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            records.push(bincode::deserialize(&payload)?);
        }
        Ok(records)
    }
}

impl Wal for FileWal {
    fn append(&self, record: WalRecord) -> Result<()> {
        let payload = bincode::serialize(&record)?;
        let mut writer = self.writer.lock();
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&payload)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::new(file);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryWal {
    records: Mutex<Vec<WalRecord>>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<WalRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Wal for MemoryWal {
    fn append(&self, record: WalRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_wal_frames_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = FileWal::open(&path).unwrap();
            wal.add_to_updated_tables(3).unwrap();
            wal.log_table_statistics(3, 42).unwrap();
            wal.log_commit(9).unwrap();
        }
        let records = FileWal::read_records(&path).unwrap();
        assert_eq!(
            records,
            vec![
                WalRecord::UpdatedTable { table_id: 3 },
                WalRecord::TableStatistics { table_id: 3, num_rows: 42 },
                WalRecord::Commit { transaction_id: 9 },
            ]
        );
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let wal = FileWal::open(&path).unwrap();
        wal.log_checkpoint().unwrap();
        drop(wal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        assert_eq!(FileWal::read_records(&path).unwrap(), vec![WalRecord::Checkpoint]);
    }

    #[test]
    fn test_clear_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let wal = FileWal::open(&path).unwrap();
        wal.log_commit(1).unwrap();
        wal.clear().unwrap();
        wal.log_commit(2).unwrap();
        assert_eq!(
            FileWal::read_records(&path).unwrap(),
            vec![WalRecord::Commit { transaction_id: 2 }]
        );
    }
}
