//! Byte codec for stored objects.
//!
//! A stored object is framed as
//!
//! ```text
//! +----------------+---------------------+-----------+
//! | i32 size (BE)  | payload             | zero pad  |
//! +----------------+---------------------+-----------+
//! |<-------------------- size bytes --------------->|
//! ```
//!
//! `size` includes the 4-byte prefix and the padding and is always a
//! multiple of the row padding. All integers are big-endian.

use crate::common::{Error, Result};

/// Bytes taken by the size prefix.
pub const SIZE_PREFIX: u32 = 4;

/// Stored size of an object with `real_size` payload bytes.
#[inline]
pub fn storage_size_for(real_size: u32, padding: u32) -> u32 {
    let raw = SIZE_PREFIX + real_size;
    raw.div_ceil(padding) * padding
}

/// Growable output buffer for encoding objects.
#[derive(Debug, Default)]
pub struct RowOutput {
    buf: Vec<u8>,
}

impl RowOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn write_byte(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_short(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_int(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_long(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Zero-fill up to `total` bytes. Does nothing if already that long.
    pub fn pad_to(&mut self, total: usize) {
        if self.buf.len() < total {
            self.buf.resize(total, 0);
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Cursor over the bytes of one stored object.
#[derive(Debug)]
pub struct RowInput {
    data: Vec<u8>,
    offset: usize,
    /// File position (scale units) the bytes were read from.
    file_position: u64,
}

impl RowInput {
    pub fn new(data: Vec<u8>, file_position: u64) -> Self {
        Self {
            data,
            offset: 0,
            file_position,
        }
    }

    #[inline]
    pub fn file_position(&self) -> u64 {
        self.file_position
    }

    /// Total bytes, including the size prefix when present.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, count: usize) -> Result<&[u8]> {
        if count > self.remaining() {
            return Err(Error::DataFileCorrupt(format!(
                "object at {} truncated: needed {} bytes at offset {}, {} available",
                self.file_position,
                count,
                self.offset,
                self.remaining()
            )));
        }
        let start = self.offset;
        self.offset += count;
        Ok(&self.data[start..self.offset])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_short(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_int(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_long(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    /// Everything left, padding included.
    pub fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.data[self.offset..].to_vec();
        self.offset = self.data.len();
        rest
    }

    /// Read and check the size prefix; returns the stored size.
    pub fn read_size_prefix(&mut self) -> Result<u32> {
        let size = self.read_int()?;
        if size < SIZE_PREFIX as i32 || size as usize != self.data.len() {
            return Err(Error::DataFileCorrupt(format!(
                "object at {} has size prefix {} but {} bytes were read",
                self.file_position,
                size,
                self.data.len()
            )));
        }
        Ok(size as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_size_for() {
        assert_eq!(storage_size_for(0, 8), 8);
        assert_eq!(storage_size_for(4, 8), 8);
        assert_eq!(storage_size_for(5, 8), 16);
        assert_eq!(storage_size_for(60, 64), 64);
        assert_eq!(storage_size_for(61, 64), 128);
    }

    #[test]
    fn test_integers_are_big_endian() {
        let mut out = RowOutput::new();
        out.write_int(0x0102_0304);
        out.write_short(0x0506);
        assert_eq!(out.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_pad_to() {
        let mut out = RowOutput::new();
        out.write_byte(7);
        out.pad_to(8);
        assert_eq!(out.as_bytes(), &[7, 0, 0, 0, 0, 0, 0, 0]);
        out.pad_to(4);
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn test_read_mixed_values() {
        let mut out = RowOutput::new();
        out.write_long(-2);
        out.write_int(99);
        out.write_bytes(b"abc");

        let mut input = RowInput::new(out.as_bytes().to_vec(), 5);
        assert_eq!(input.read_long().unwrap(), -2);
        assert_eq!(input.read_int().unwrap(), 99);
        assert_eq!(input.read_bytes(3).unwrap(), b"abc");
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn test_read_past_end_is_corrupt() {
        let mut input = RowInput::new(vec![0, 0], 3);
        let err = input.read_int().unwrap_err();
        assert!(matches!(err, Error::DataFileCorrupt(_)));
        // Nothing consumed on failure
        assert_eq!(input.remaining(), 2);
    }

    #[test]
    fn test_size_prefix_must_match_length() {
        let mut out = RowOutput::new();
        out.write_int(8);
        out.pad_to(8);
        let mut input = RowInput::new(out.as_bytes().to_vec(), 0);
        assert_eq!(input.read_size_prefix().unwrap(), 8);

        let mut bad = RowInput::new(vec![0, 0, 0, 16, 0, 0, 0, 0], 0);
        assert!(bad.read_size_prefix().is_err());
    }
}
