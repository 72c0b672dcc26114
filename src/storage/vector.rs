//! Columnar batches exchanged with callers: null masks, selection vectors and value vectors

use crate::error::{Result, StorageError};
use super::{PhysicalType, Value};

/// Bitset of null positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullMask {
    words: Vec<u64>,
    len: usize,
}

impl NullMask {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_null(&self, pos: usize) -> bool {
        assert!(pos < self.len, "null mask position {} out of bounds {}", pos, self.len);
        self.words[pos / 64] & (1 << (pos % 64)) != 0
    }

    pub fn set_null(&mut self, pos: usize, null: bool) {
        assert!(pos < self.len, "null mask position {} out of bounds {}", pos, self.len);
        let bit = 1u64 << (pos % 64);
        if null {
            self.words[pos / 64] |= bit;
        } else {
            self.words[pos / 64] &= !bit;
        }
    }

    pub fn set_all(&mut self, null: bool) {
        let fill = if null { u64::MAX } else { 0 };
        self.words.iter_mut().for_each(|w| *w = fill);
    }

    pub fn has_nulls(&self) -> bool {
        (0..self.len).any(|pos| self.is_null(pos))
    }

    pub fn resize(&mut self, len: usize) {
        self.words.resize(len.div_ceil(64), 0);
        self.len = len;
    }
}

/// Which positions of a batch are visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionVector {
    /// Positions `0..n`
    Unfiltered(usize),
    Filtered(Vec<usize>),
}

impl SelectionVector {
    pub fn unfiltered(size: usize) -> Self {
        SelectionVector::Unfiltered(size)
    }

    pub fn len(&self) -> usize {
        match self {
            SelectionVector::Unfiltered(n) => *n,
            SelectionVector::Filtered(positions) => positions.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_unfiltered(&self) -> bool {
        matches!(self, SelectionVector::Unfiltered(_))
    }

    pub fn get(&self, i: usize) -> usize {
        match self {
            SelectionVector::Unfiltered(_) => i,
            SelectionVector::Filtered(positions) => positions[i],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// A typed, fixed-capacity batch of nullable values.
#[derive(Debug, Clone)]
pub struct ValueVector {
    data_type: PhysicalType,
    capacity: usize,
    data: Vec<u8>,
    nulls: NullMask,
    pub sel: SelectionVector,
}

impl ValueVector {
    pub fn new(data_type: PhysicalType, capacity: usize) -> Self {
        let mut nulls = NullMask::new(capacity);
        nulls.set_all(true);
        Self {
            data_type,
            capacity,
            data: vec![0; capacity * data_type.width()],
            nulls,
            sel: SelectionVector::unfiltered(0),
        }
    }

    /// Builds a vector holding exactly `values`, all selected.
    pub fn from_values(data_type: PhysicalType, values: &[Option<Value>]) -> Result<Self> {
        let mut vector = Self::new(data_type, values.len());
        for (pos, value) in values.iter().enumerate() {
            vector.set_value(pos, *value)?;
        }
        vector.sel = SelectionVector::unfiltered(values.len());
        Ok(vector)
    }

    pub fn data_type(&self) -> PhysicalType {
        self.data_type
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_null(&self, pos: usize) -> bool {
        self.nulls.is_null(pos)
    }

    pub fn set_null(&mut self, pos: usize, null: bool) {
        self.nulls.set_null(pos, null);
    }

    pub fn get_value(&self, pos: usize) -> Option<Value> {
        if self.is_null(pos) {
            None
        } else {
            Some(Value::read_le(self.data_type, self.raw(pos)))
        }
    }

    /// Writes `value` at `pos`, casting it to the vector type first.
    pub fn set_value(&mut self, pos: usize, value: Option<Value>) -> Result<()> {
        match value {
            None => self.set_null(pos, true),
            Some(v) => {
                let v = v.cast(self.data_type)?;
                let width = self.data_type.width();
                v.write_le(&mut self.data[pos * width..(pos + 1) * width]);
                self.set_null(pos, false);
            }
        }
        Ok(())
    }

    pub fn raw(&self, pos: usize) -> &[u8] {
        let width = self.data_type.width();
        &self.data[pos * width..(pos + 1) * width]
    }

    pub(crate) fn set_raw(&mut self, pos: usize, bytes: &[u8], null: bool) {
        let width = self.data_type.width();
        self.data[pos * width..(pos + 1) * width].copy_from_slice(bytes);
        self.set_null(pos, null);
    }

    /// Selected values in selection order.
    pub fn selected_values(&self) -> Vec<Option<Value>> {
        self.sel.iter().map(|pos| self.get_value(pos)).collect()
    }

    pub(crate) fn check_type(&self, expected: PhysicalType) -> Result<()> {
        if self.data_type != expected {
            return Err(StorageError::TypeMismatch {
                expected,
                actual: self.data_type,
            });
        }
        Ok(())
    }
}
