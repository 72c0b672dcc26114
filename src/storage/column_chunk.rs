//! In-memory column chunk: a typed, nullable, fixed-capacity buffer
//!
//! A chunk holds the values of one column for (a range of) one node group.
//! It is the unit of bulk I/O: checkpoint and CSR rebalancing build chunks in
//! memory and hand them to [`Column`](super::Column) to persist.

use crate::error::{Result, StorageError};
use super::compression::CompressionMetadata;
use super::vector::{NullMask, SelectionVector, ValueVector};
use super::{Offset, PhysicalType, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnChunk {
    data_type: PhysicalType,
    capacity: u64,
    num_values: u64,
    data: Vec<u8>,
    nulls: NullMask,
}

impl ColumnChunk {
    pub fn new(data_type: PhysicalType, capacity: u64) -> Self {
        let mut nulls = NullMask::new(capacity as usize);
        nulls.set_all(true);
        Self {
            data_type,
            capacity,
            num_values: 0,
            data: vec![0; capacity as usize * data_type.width()],
            nulls,
        }
    }

    pub fn from_values(data_type: PhysicalType, values: &[Option<Value>]) -> Result<Self> {
        let mut chunk = Self::new(data_type, values.len() as u64);
        for value in values {
            chunk.append_value(*value)?;
        }
        Ok(chunk)
    }

    pub fn data_type(&self) -> PhysicalType {
        self.data_type
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn num_values(&self) -> u64 {
        self.num_values
    }

    pub fn is_empty(&self) -> bool {
        self.num_values == 0
    }

    pub fn set_num_values(&mut self, num_values: u64) {
        assert!(
            num_values <= self.capacity,
            "num_values {} beyond chunk capacity {}",
            num_values,
            self.capacity
        );
        self.num_values = num_values;
    }

    fn width(&self) -> usize {
        self.data_type.width()
    }

    fn check_pos(&self, pos: u64) {
        assert!(pos < self.capacity, "position {} beyond chunk capacity {}", pos, self.capacity);
    }

    pub fn is_null(&self, pos: u64) -> bool {
        self.check_pos(pos);
        self.nulls.is_null(pos as usize)
    }

    pub fn raw(&self, pos: u64) -> &[u8] {
        self.check_pos(pos);
        let w = self.width();
        &self.data[pos as usize * w..(pos as usize + 1) * w]
    }

    /// Stores already-encoded bytes; grows `num_values` to cover `pos`.
    pub(crate) fn set_raw(&mut self, pos: u64, bytes: &[u8], null: bool) {
        self.check_pos(pos);
        let w = self.width();
        self.data[pos as usize * w..(pos as usize + 1) * w].copy_from_slice(bytes);
        self.nulls.set_null(pos as usize, null);
        self.num_values = self.num_values.max(pos + 1);
    }

    pub fn get_value(&self, pos: u64) -> Option<Value> {
        if self.is_null(pos) {
            None
        } else {
            Some(Value::read_le(self.data_type, self.raw(pos)))
        }
    }

    pub fn set_value(&mut self, pos: u64, value: Option<Value>) -> Result<()> {
        self.check_pos(pos);
        match value {
            None => {
                self.nulls.set_null(pos as usize, true);
                self.num_values = self.num_values.max(pos + 1);
            }
            Some(v) => {
                let v = v.cast(self.data_type)?;
                let mut buf = [0u8; 8];
                v.write_le(&mut buf[..self.width()]);
                self.set_raw(pos, &buf[..self.width()], false);
            }
        }
        Ok(())
    }

    /// Reads an offset-like UInt64 slot; nulls read as 0.
    pub fn get_u64(&self, pos: u64) -> u64 {
        debug_assert_eq!(self.data_type, PhysicalType::UInt64);
        if self.is_null(pos) {
            return 0;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.raw(pos));
        u64::from_le_bytes(buf)
    }

    pub fn set_u64(&mut self, pos: u64, value: u64) {
        debug_assert_eq!(self.data_type, PhysicalType::UInt64);
        self.set_raw(pos, &value.to_le_bytes(), false);
    }

    pub fn append_value(&mut self, value: Option<Value>) -> Result<()> {
        if self.num_values >= self.capacity {
            return Err(StorageError::CapacityExceeded {
                required: self.num_values + 1,
                capacity: self.capacity,
            });
        }
        self.set_value(self.num_values, value)
    }

    /// Appends the rows of `vector` picked by `sel`.
    ///
    /// Values are cast to the chunk type up front, so an out-of-range value
    /// fails the whole call with the chunk untouched.
    pub fn append(&mut self, vector: &ValueVector, sel: &SelectionVector) -> Result<()> {
        let count = sel.len() as u64;
        if self.num_values + count > self.capacity {
            return Err(StorageError::CapacityExceeded {
                required: self.num_values + count,
                capacity: self.capacity,
            });
        }
        if vector.data_type() == self.data_type {
            for pos in sel.iter() {
                self.set_raw(self.num_values, vector.raw(pos), vector.is_null(pos));
            }
            return Ok(());
        }
        let cast: Vec<Option<Value>> = sel
            .iter()
            .map(|pos| vector.get_value(pos).map(|v| v.cast(self.data_type)).transpose())
            .collect::<Result<_>>()?;
        for value in cast {
            self.set_value(self.num_values, value)?;
        }
        Ok(())
    }

    /// Appends `count` rows of `src` starting at `src_start`.
    pub fn append_chunk(&mut self, src: &ColumnChunk, src_start: u64, count: u64) -> Result<()> {
        if self.num_values + count > self.capacity {
            return Err(StorageError::CapacityExceeded {
                required: self.num_values + count,
                capacity: self.capacity,
            });
        }
        let dst = self.num_values;
        self.copy(src, src_start, dst, count);
        Ok(())
    }

    /// Copies `count` rows from `src` into this chunk at `dst_start`.
    pub fn copy(&mut self, src: &ColumnChunk, src_start: u64, dst_start: u64, count: u64) {
        assert_eq!(self.data_type, src.data_type, "copy between chunks of different types");
        if count == 0 {
            return;
        }
        assert!(src_start + count <= src.capacity, "copy source out of bounds");
        assert!(dst_start + count <= self.capacity, "copy destination out of bounds");
        let w = self.width();
        let (s, d, n) = (src_start as usize, dst_start as usize, count as usize);
        self.data[d * w..(d + n) * w].copy_from_slice(&src.data[s * w..(s + n) * w]);
        for i in 0..n {
            self.nulls.set_null(d + i, src.nulls.is_null(s + i));
        }
        self.num_values = self.num_values.max(dst_start + count);
    }

    /// Overlap-safe copy inside this chunk.
    pub fn copy_within(&mut self, src_start: u64, dst_start: u64, count: u64) {
        if count == 0 || src_start == dst_start {
            return;
        }
        assert!(src_start + count <= self.capacity, "copy source out of bounds");
        assert!(dst_start + count <= self.capacity, "copy destination out of bounds");
        let w = self.width();
        let (s, d, n) = (src_start as usize, dst_start as usize, count as usize);
        self.data.copy_within(s * w..(s + n) * w, d * w);
        if d < s {
            for i in 0..n {
                let null = self.nulls.is_null(s + i);
                self.nulls.set_null(d + i, null);
            }
        } else {
            for i in (0..n).rev() {
                let null = self.nulls.is_null(s + i);
                self.nulls.set_null(d + i, null);
            }
        }
        self.num_values = self.num_values.max(dst_start + count);
    }

    /// Scatters the rows of `src` to the positions listed in `dst_offsets`.
    pub fn write(&mut self, src: &ColumnChunk, dst_offsets: &ColumnChunk) {
        assert_eq!(src.num_values, dst_offsets.num_values, "one destination per source row");
        for i in 0..src.num_values {
            let dst = dst_offsets.get_u64(i);
            self.copy(src, i, dst, 1);
        }
    }

    /// Copies rows `[start, end)` into `out` starting at `out_offset`.
    pub fn scan(&self, start: u64, end: u64, out: &mut ValueVector, out_offset: usize) -> Result<()> {
        out.check_type(self.data_type)?;
        assert!(end <= self.capacity, "scan beyond chunk capacity");
        for (i, pos) in (start..end).enumerate() {
            out.set_raw(out_offset + i, self.raw(pos), self.nulls.is_null(pos as usize));
        }
        Ok(())
    }

    pub fn lookup(&self, pos: u64, out: &mut ValueVector, out_pos: usize) -> Result<()> {
        self.scan(pos, pos + 1, out, out_pos)
    }

    /// Reallocates to `new_capacity`, keeping the first `num_values` rows.
    pub fn resize(&mut self, new_capacity: u64) {
        assert!(
            new_capacity >= self.num_values,
            "shrinking chunk below its {} values",
            self.num_values
        );
        let mut resized = ColumnChunk::new(self.data_type, new_capacity);
        resized.copy(self, 0, 0, self.num_values);
        resized.num_values = self.num_values;
        *self = resized;
    }

    /// Min/max of the integer view of non-null values in `[0, num_values)`.
    pub fn integer_range(&self) -> Option<(i128, i128)> {
        if !self.data_type.is_compressible() {
            return None;
        }
        (0..self.num_values)
            .filter(|pos| !self.is_null(*pos))
            .map(|pos| self.data_type.int_from_le(self.raw(pos)))
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    pub fn compression_metadata(&self, enable_compression: bool) -> CompressionMetadata {
        CompressionMetadata::for_range(self.data_type, self.integer_range(), enable_compression)
    }

    pub fn values(&self) -> impl Iterator<Item = Option<Value>> + '_ {
        (0..self.num_values).map(move |pos| self.get_value(pos))
    }
}

/// `count` consecutive offsets starting at `start`.
pub fn fill_sequence(start: Offset, count: u64) -> Vec<Offset> {
    (start..start + count).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<Option<Value>> {
        values.iter().map(|v| Some(Value::Int64(*v))).collect()
    }

    #[test]
    fn test_append_respects_capacity() {
        let mut chunk = ColumnChunk::new(PhysicalType::Int64, 3);
        let vector = ValueVector::from_values(PhysicalType::Int64, &ints(&[1, 2, 3, 4])).unwrap();

        let err = chunk.append(&vector, &SelectionVector::unfiltered(4)).unwrap_err();
        assert!(matches!(err, StorageError::CapacityExceeded { required: 4, capacity: 3 }));
        assert_eq!(chunk.num_values(), 0);

        chunk.append(&vector, &SelectionVector::Filtered(vec![3, 0])).unwrap();
        assert_eq!(chunk.values().collect::<Vec<_>>(), ints(&[4, 1]));
    }

    #[test]
    fn test_narrowing_append_leaves_chunk_untouched_on_error() {
        let mut chunk = ColumnChunk::new(PhysicalType::Int32, 4);
        chunk.append_value(Some(Value::Int32(7))).unwrap();
        let vector =
            ValueVector::from_values(PhysicalType::Int64, &ints(&[1, i64::MAX])).unwrap();

        let err = chunk.append(&vector, &SelectionVector::unfiltered(2)).unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { .. }));
        assert_eq!(chunk.num_values(), 1);
        assert!(chunk.is_null(1));
    }

    #[test]
    fn test_copy_within_handles_overlap() {
        let mut chunk = ColumnChunk::from_values(PhysicalType::Int64, &ints(&[1, 2, 3, 4, 5])).unwrap();
        chunk.resize(8);
        chunk.copy_within(0, 2, 5);
        assert_eq!(chunk.values().collect::<Vec<_>>(), ints(&[1, 2, 1, 2, 3, 4, 5]));

        chunk.copy_within(2, 0, 5);
        assert_eq!(chunk.get_value(0), Some(Value::Int64(1)));
        assert_eq!(chunk.get_value(4), Some(Value::Int64(5)));
    }

    #[test]
    fn test_write_scatters_by_offset_chunk() {
        let src = ColumnChunk::from_values(PhysicalType::Int64, &ints(&[10, 20, 30])).unwrap();
        let mut offsets = ColumnChunk::new(PhysicalType::UInt64, 3);
        for (i, dst) in [4u64, 0, 2].iter().enumerate() {
            offsets.set_u64(i as u64, *dst);
        }
        let mut dst = ColumnChunk::new(PhysicalType::Int64, 6);
        dst.write(&src, &offsets);

        assert_eq!(dst.num_values(), 5);
        assert_eq!(dst.get_value(0), Some(Value::Int64(20)));
        assert_eq!(dst.get_value(2), Some(Value::Int64(30)));
        assert_eq!(dst.get_value(4), Some(Value::Int64(10)));
        assert!(dst.is_null(1));
    }

    #[test]
    fn test_scan_into_vector() {
        let chunk = ColumnChunk::from_values(
            PhysicalType::Int64,
            &[Some(Value::Int64(1)), None, Some(Value::Int64(3))],
        )
        .unwrap();
        let mut out = ValueVector::new(PhysicalType::Int64, 4);
        chunk.scan(1, 3, &mut out, 1).unwrap();
        assert!(out.is_null(1));
        assert_eq!(out.get_value(2), Some(Value::Int64(3)));

        let mut wrong = ValueVector::new(PhysicalType::Bool, 4);
        assert!(chunk.scan(0, 1, &mut wrong, 0).is_err());
    }

    #[test]
    #[should_panic(expected = "beyond chunk capacity")]
    fn test_write_past_capacity_asserts() {
        let mut chunk = ColumnChunk::new(PhysicalType::UInt64, 2);
        chunk.set_u64(2, 1);
    }

    #[test]
    fn test_integer_range_skips_nulls() {
        let chunk = ColumnChunk::from_values(
            PhysicalType::Int64,
            &[None, Some(Value::Int64(-3)), Some(Value::Int64(9)), None],
        )
        .unwrap();
        assert_eq!(chunk.integer_range(), Some((-3, 9)));
    }
}
