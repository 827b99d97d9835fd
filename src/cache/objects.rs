//! Built-in cached object types.

use std::any::Any;

use bitvec::prelude::*;
use parking_lot::RwLock;

use crate::common::{Error, ObjectKind, Result};

use super::codec::{RowInput, RowOutput};
use super::object::{CachedObject, ObjectHeader};

/// A table row with an opaque payload.
///
/// The payload is immutable; an update is a remove followed by an add of
/// a new row.
#[derive(Debug)]
pub struct DataRow {
    header: ObjectHeader,
    payload: Vec<u8>,
}

impl DataRow {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            header: ObjectHeader::new(),
            payload: payload.into(),
        }
    }

    /// Decode a row stored at `input.file_position()`.
    pub fn read_from(input: &mut RowInput, storage_size: u32) -> Result<Self> {
        let len = input.read_int()?;
        if len < 0 {
            return Err(Error::DataFileCorrupt(format!(
                "row at {} has negative payload length {}",
                input.file_position(),
                len
            )));
        }
        let payload = input.read_bytes(len as usize)?;
        Ok(Self {
            header: ObjectHeader::loaded(input.file_position(), storage_size),
            payload,
        })
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl CachedObject for DataRow {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Row
    }

    fn real_size(&self) -> u32 {
        4 + self.payload.len() as u32
    }

    fn write_to(&self, out: &mut RowOutput) {
        out.write_int(self.payload.len() as i32);
        out.write_bytes(&self.payload);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Fixed-length array of ints, the shape of index and directory nodes.
#[derive(Debug)]
pub struct IntArrayObject {
    header: ObjectHeader,
    values: RwLock<Vec<i32>>,
}

impl IntArrayObject {
    /// Zeroed array of `len` ints.
    pub fn new(len: usize) -> Self {
        Self {
            header: ObjectHeader::new(),
            values: RwLock::new(vec![0; len]),
        }
    }

    pub fn from_values(values: Vec<i32>) -> Self {
        Self {
            header: ObjectHeader::new(),
            values: RwLock::new(values),
        }
    }

    pub fn read_from(input: &mut RowInput, storage_size: u32) -> Result<Self> {
        let len = input.read_int()?;
        if len < 0 || len as usize * 4 > input.remaining() {
            return Err(Error::DataFileCorrupt(format!(
                "int array at {} has bad length {}",
                input.file_position(),
                len
            )));
        }
        let values = (0..len)
            .map(|_| input.read_int())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            header: ObjectHeader::loaded(input.file_position(), storage_size),
            values: RwLock::new(values),
        })
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<i32> {
        self.values.read().get(index).copied()
    }

    /// Overwrite one element and mark the object changed.
    pub fn set(&self, index: usize, value: i32) -> Result<()> {
        let mut values = self.values.write();
        let len = values.len();
        let slot = values.get_mut(index).ok_or_else(|| {
            Error::InvariantViolation(format!("int array index {} out of bounds ({})", index, len))
        })?;
        *slot = value;
        self.header.set_changed(true);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<i32> {
        self.values.read().clone()
    }
}

impl CachedObject for IntArrayObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::IntArray
    }

    fn real_size(&self) -> u32 {
        4 + 4 * self.values.read().len() as u32
    }

    fn write_to(&self, out: &mut RowOutput) {
        let values = self.values.read();
        out.write_int(values.len() as i32);
        for &value in values.iter() {
            out.write_int(value);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Bitmap stored as whole 32-bit words, most significant bit first.
#[derive(Debug)]
pub struct BitMapObject {
    header: ObjectHeader,
    bits: RwLock<BitVec<u32, Msb0>>,
}

impl BitMapObject {
    /// Cleared bitmap with room for at least `bit_count` bits.
    pub fn new(bit_count: usize) -> Self {
        let words = bit_count.div_ceil(32);
        Self {
            header: ObjectHeader::new(),
            bits: RwLock::new(BitVec::repeat(false, words * 32)),
        }
    }

    pub fn read_from(input: &mut RowInput, storage_size: u32) -> Result<Self> {
        let words = input.read_int()?;
        if words < 0 || words as usize * 4 > input.remaining() {
            return Err(Error::DataFileCorrupt(format!(
                "bitmap at {} has bad word count {}",
                input.file_position(),
                words
            )));
        }
        let raw = (0..words)
            .map(|_| input.read_int().map(|w| w as u32))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            header: ObjectHeader::loaded(input.file_position(), storage_size),
            bits: RwLock::new(BitVec::from_vec(raw)),
        })
    }

    pub fn bit_count(&self) -> usize {
        self.bits.read().len()
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.bits.read().get(index).map(|b| *b).unwrap_or(false)
    }

    /// Set or clear one bit. Returns the previous value.
    pub fn set(&self, index: usize, value: bool) -> Result<bool> {
        let mut bits = self.bits.write();
        if index >= bits.len() {
            return Err(Error::InvariantViolation(format!(
                "bit {} out of bounds ({})",
                index,
                bits.len()
            )));
        }
        let old = bits.replace(index, value);
        if old != value {
            self.header.set_changed(true);
        }
        Ok(old)
    }

    pub fn count_set(&self) -> usize {
        self.bits.read().count_ones()
    }
}

impl CachedObject for BitMapObject {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::BitMap
    }

    fn real_size(&self) -> u32 {
        4 + (self.bits.read().len() / 8) as u32
    }

    fn write_to(&self, out: &mut RowOutput) {
        let bits = self.bits.read();
        let words = bits.as_raw_slice();
        out.write_int(words.len() as i32);
        for &word in words {
            out.write_int(word as i32);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
