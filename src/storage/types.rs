//! Physical value types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicalType {
    Bool,
    Int32,
    Int64,
    UInt64,
    Double,
}

impl PhysicalType {
    /// Bytes per value in memory.
    pub fn width(self) -> usize {
        match self {
            PhysicalType::Bool => 1,
            PhysicalType::Int32 => 4,
            PhysicalType::Int64 | PhysicalType::UInt64 | PhysicalType::Double => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, PhysicalType::Int32 | PhysicalType::Int64 | PhysicalType::UInt64)
    }

    /// Types whose values have an exact integer view and can be packed.
    pub fn is_compressible(self) -> bool {
        self != PhysicalType::Double
    }

    /// Integer view of a little-endian encoded value.
    pub(crate) fn int_from_le(self, bytes: &[u8]) -> i128 {
        match self {
            PhysicalType::Bool => (bytes[0] != 0) as i128,
            PhysicalType::Int32 => i32::from_le_bytes(le_array(bytes)) as i128,
            PhysicalType::Int64 => i64::from_le_bytes(le_array(bytes)) as i128,
            PhysicalType::UInt64 => u64::from_le_bytes(le_array(bytes)) as i128,
            PhysicalType::Double => panic!("double has no integer view"),
        }
    }

    /// Inverse of [`int_from_le`](Self::int_from_le); the value must already be in range.
    pub(crate) fn int_to_le(self, value: i128, out: &mut [u8]) {
        match self {
            PhysicalType::Bool => out[0] = (value != 0) as u8,
            PhysicalType::Int32 => out.copy_from_slice(&(value as i32).to_le_bytes()),
            PhysicalType::Int64 => out.copy_from_slice(&(value as i64).to_le_bytes()),
            PhysicalType::UInt64 => out.copy_from_slice(&(value as u64).to_le_bytes()),
            PhysicalType::Double => panic!("double has no integer view"),
        }
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes[..N]);
    arr
}

/// A single non-null scalar. Nulls travel as `Option<Value>`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
}

impl Value {
    pub fn data_type(&self) -> PhysicalType {
        match self {
            Value::Bool(_) => PhysicalType::Bool,
            Value::Int32(_) => PhysicalType::Int32,
            Value::Int64(_) => PhysicalType::Int64,
            Value::UInt64(_) => PhysicalType::UInt64,
            Value::Double(_) => PhysicalType::Double,
        }
    }

    pub fn write_le(&self, out: &mut [u8]) {
        match *self {
            Value::Bool(v) => out[0] = v as u8,
            Value::Int32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Value::Int64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Value::UInt64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Value::Double(v) => out.copy_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn read_le(data_type: PhysicalType, bytes: &[u8]) -> Value {
        match data_type {
            PhysicalType::Bool => Value::Bool(bytes[0] != 0),
            PhysicalType::Int32 => Value::Int32(i32::from_le_bytes(le_array(bytes))),
            PhysicalType::Int64 => Value::Int64(i64::from_le_bytes(le_array(bytes))),
            PhysicalType::UInt64 => Value::UInt64(u64::from_le_bytes(le_array(bytes))),
            PhysicalType::Double => Value::Double(f64::from_le_bytes(le_array(bytes))),
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::Int32(v) => Some(v as i128),
            Value::Int64(v) => Some(v as i128),
            Value::UInt64(v) => Some(v as i128),
            Value::Bool(_) | Value::Double(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    /// Lossless conversion to `target`. Narrowing integer casts are range checked.
    pub fn cast(&self, target: PhysicalType) -> Result<Value> {
        let source = self.data_type();
        if source == target {
            return Ok(*self);
        }
        let out_of_range = || StorageError::OutOfRange {
            value: self.to_string(),
            data_type: target,
        };
        match (self.as_i128(), target) {
            (Some(v), PhysicalType::Int32) => i32::try_from(v).map(Value::Int32).map_err(|_| out_of_range()),
            (Some(v), PhysicalType::Int64) => i64::try_from(v).map(Value::Int64).map_err(|_| out_of_range()),
            (Some(v), PhysicalType::UInt64) => u64::try_from(v).map(Value::UInt64).map_err(|_| out_of_range()),
            (Some(v), PhysicalType::Double) => Ok(Value::Double(v as f64)),
            _ => Err(StorageError::TypeMismatch {
                expected: target,
                actual: source,
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrowing_cast_is_range_checked() {
        assert_eq!(Value::Int64(12).cast(PhysicalType::Int32).unwrap(), Value::Int32(12));
        assert!(matches!(
            Value::Int64(i64::from(i32::MAX) + 1).cast(PhysicalType::Int32),
            Err(StorageError::OutOfRange { data_type: PhysicalType::Int32, .. })
        ));
        assert!(Value::Int32(-1).cast(PhysicalType::UInt64).is_err());
    }

    #[test]
    fn test_bool_does_not_cast_to_integer() {
        assert!(matches!(
            Value::Bool(true).cast(PhysicalType::Int64),
            Err(StorageError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_integer_view_of_encoded_bytes() {
        let mut buf = [0u8; 4];
        Value::Int32(-7).write_le(&mut buf);
        assert_eq!(PhysicalType::Int32.int_from_le(&buf), -7);

        let mut out = [0u8; 8];
        PhysicalType::UInt64.int_to_le(u64::MAX as i128, &mut out);
        assert_eq!(Value::read_le(PhysicalType::UInt64, &out), Value::UInt64(u64::MAX));
    }
}
