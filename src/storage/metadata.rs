//! Checkpointed table metadata (`metadata.bin`)
//!
//! Layout: magic, format version, body length, blake3 hash of the body,
//! then the bincode-encoded [`DatabaseMetadata`].

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use super::node_table::NodeTableSnapshot;
use super::rel_table::RelTableSnapshot;
use super::TableId;

pub const MAGIC: [u8; 4] = *b"NGDB";

pub const FORMAT_VERSION: u16 = 1;

/// Header bytes on disk: magic + version + body length + hash
pub const HEADER_SIZE: usize = 4 + 2 + 8 + 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub next_table_id: TableId,
    pub node_tables: Vec<NodeTableSnapshot>,
    pub rel_tables: Vec<RelTableSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub body_len: u64,
    pub hash: [u8; 32],
}

impl MetadataHeader {
    pub fn for_body(body: &[u8]) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            body_len: body.len() as u64,
            hash: *blake3::hash(body).as_bytes(),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..14].copy_from_slice(&self.body_len.to_le_bytes());
        out[14..46].copy_from_slice(&self.hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StorageError::InvalidFormat(format!(
                "metadata header too short: {} bytes",
                bytes.len()
            )));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut version = [0u8; 2];
        version.copy_from_slice(&bytes[4..6]);
        let mut body_len = [0u8; 8];
        body_len.copy_from_slice(&bytes[6..14]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[14..46]);
        Ok(Self {
            magic,
            version: u16::from_le_bytes(version),
            body_len: u64::from_le_bytes(body_len),
            hash,
        })
    }

    pub fn validate(&self, body: &[u8]) -> Result<()> {
        if self.magic != MAGIC {
            return Err(StorageError::InvalidFormat(format!("bad magic number: {:?}", self.magic)));
        }
        if self.version != FORMAT_VERSION {
            return Err(StorageError::InvalidFormat(format!(
                "unsupported format version: {}",
                self.version
            )));
        }
        if self.body_len != body.len() as u64 {
            return Err(StorageError::InvalidFormat(format!(
                "metadata body is {} bytes, header says {}",
                body.len(),
                self.body_len
            )));
        }
        if blake3::hash(body).as_bytes() != &self.hash {
            return Err(StorageError::InvalidFormat("metadata checksum mismatch".into()));
        }
        Ok(())
    }
}

/// Writes `metadata` next to `path` and renames it into place.
pub fn write_metadata(path: &Path, metadata: &DatabaseMetadata) -> Result<()> {
    let body = bincode::serialize(metadata)?;
    let header = MetadataHeader::for_body(&body);
    let tmp = path.with_extension("bin.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&header.to_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    tracing::debug!(
        path = %path.display(),
        bytes = HEADER_SIZE + body.len(),
        node_tables = metadata.node_tables.len(),
        rel_tables = metadata.rel_tables.len(),
        "Wrote metadata"
    );
    Ok(())
}

pub fn read_metadata(path: &Path) -> Result<DatabaseMetadata> {
    let bytes = fs::read(path)?;
    let header = MetadataHeader::from_bytes(&bytes)?;
    let body = &bytes[HEADER_SIZE..];
    header.validate(body)?;
    Ok(bincode::deserialize(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> DatabaseMetadata {
        DatabaseMetadata {
            next_table_id: 4,
            node_tables: Vec::new(),
            rel_tables: Vec::new(),
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.bin");
        write_metadata(&path, &sample()).unwrap();
        assert_eq!(read_metadata(&path).unwrap(), sample());
        assert!(!path.with_extension("bin.tmp").exists());
    }

    #[test]
    fn test_corruption_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.bin");
        write_metadata(&path, &sample()).unwrap();
        let good = fs::read(&path).unwrap();

        let mut flipped = good.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        fs::write(&path, &flipped).unwrap();
        assert!(matches!(read_metadata(&path), Err(StorageError::InvalidFormat(_))));

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        fs::write(&path, &bad_magic).unwrap();
        assert!(matches!(read_metadata(&path), Err(StorageError::InvalidFormat(_))));

        let mut bad_version = good.clone();
        bad_version[4] = 9;
        fs::write(&path, &bad_version).unwrap();
        assert!(matches!(read_metadata(&path), Err(StorageError::InvalidFormat(_))));

        fs::write(&path, &good[..good.len() - 2]).unwrap();
        assert!(matches!(read_metadata(&path), Err(StorageError::InvalidFormat(_))));

        fs::write(&path, &good[..10]).unwrap();
        assert!(matches!(read_metadata(&path), Err(StorageError::InvalidFormat(_))));
    }
}
