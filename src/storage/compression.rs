//! Per-chunk lightweight compression
//!
//! Integer and boolean chunks are stored frame-of-reference encoded with a
//! byte-aligned width, or as a single constant. Encoding never wraps: a value
//! outside the metadata's range is an [`StorageError::OutOfRange`].

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use super::{PhysicalType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    Uncompressed,
    /// Every non-null value equals `base`; nothing is stored per value.
    Constant,
    /// `value - base` stored in `width` bytes.
    IntegerPacking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionMetadata {
    pub kind: CompressionType,
    pub base: i128,
    /// Stored bytes per value
    pub width: u8,
}

const PACKING_WIDTHS: [u8; 4] = [1, 2, 4, 8];

impl CompressionMetadata {
    pub fn uncompressed(data_type: PhysicalType) -> Self {
        Self {
            kind: CompressionType::Uncompressed,
            base: 0,
            width: data_type.width() as u8,
        }
    }

    pub fn constant(value: i128) -> Self {
        Self {
            kind: CompressionType::Constant,
            base: value,
            width: 0,
        }
    }

    /// Narrowest scheme that holds every value in `range` (`None` when the chunk has no non-null values).
    pub fn for_range(data_type: PhysicalType, range: Option<(i128, i128)>, enabled: bool) -> Self {
        if !enabled || !data_type.is_compressible() {
            return Self::uncompressed(data_type);
        }
        let (min, max) = range.unwrap_or((0, 0));
        if min == max {
            return Self::constant(min);
        }
        let spread = (max - min) as u128;
        for width in PACKING_WIDTHS {
            if width as usize >= data_type.width() {
                break;
            }
            if spread <= max_delta(width) {
                return Self {
                    kind: CompressionType::IntegerPacking,
                    base: min,
                    width,
                };
            }
        }
        Self::uncompressed(data_type)
    }

    pub fn stored_width(&self) -> usize {
        self.width as usize
    }

    /// Whether the little-endian value `bytes` of `data_type` is representable.
    pub fn can_store(&self, data_type: PhysicalType, bytes: &[u8]) -> bool {
        match self.kind {
            CompressionType::Uncompressed => true,
            CompressionType::Constant => data_type.int_from_le(bytes) == self.base,
            CompressionType::IntegerPacking => {
                let delta = data_type.int_from_le(bytes) - self.base;
                delta >= 0 && (delta as u128) <= max_delta(self.width)
            }
        }
    }

    /// Encodes one value into `out` (`stored_width` bytes).
    pub fn encode(&self, data_type: PhysicalType, bytes: &[u8], out: &mut [u8]) -> Result<()> {
        if !self.can_store(data_type, bytes) {
            return Err(StorageError::OutOfRange {
                value: Value::read_le(data_type, bytes).to_string(),
                data_type,
            });
        }
        match self.kind {
            CompressionType::Uncompressed => out.copy_from_slice(bytes),
            CompressionType::Constant => {}
            CompressionType::IntegerPacking => {
                let delta = (data_type.int_from_le(bytes) - self.base) as u64;
                out.copy_from_slice(&delta.to_le_bytes()[..self.stored_width()]);
            }
        }
        Ok(())
    }

    /// Decodes `stored` back into the native little-endian representation.
    pub fn decode(&self, data_type: PhysicalType, stored: &[u8], out: &mut [u8]) {
        match self.kind {
            CompressionType::Uncompressed => out.copy_from_slice(stored),
            CompressionType::Constant => data_type.int_to_le(self.base, out),
            CompressionType::IntegerPacking => {
                let mut delta = [0u8; 8];
                delta[..stored.len()].copy_from_slice(stored);
                let value = self.base + u64::from_le_bytes(delta) as i128;
                data_type.int_to_le(value, out);
            }
        }
    }
}

fn max_delta(width: u8) -> u128 {
    (1u128 << (8 * width as u32)) - 1
}
