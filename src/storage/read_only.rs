//! In-memory image of a data file loaded from an arbitrary reader.

use std::io::Read;

use crate::common::{Error, Result};

use super::channel::RandomAccess;

/// A read-only channel over bytes loaded once from a [`Read`] source,
/// such as a resource bundled inside an archive.
///
/// Every mutating call fails with [`Error::ReadOnly`].
pub struct ReadOnlyImage {
    data: Vec<u8>,
    position: u64,
}

impl ReadOnlyImage {
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(Self { data, position: 0 })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }
}

impl RandomAccess for ReadOnlyImage {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let start = self.position as usize;
        let end = start + buf.len();
        if self.position > self.data.len() as u64 || end > self.data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {} bytes at {} past end of image ({} bytes)",
                    buf.len(),
                    self.position,
                    self.data.len()
                ),
            )));
        }

        buf.copy_from_slice(&self.data[start..end]);
        self.position = end as u64;
        Ok(())
    }

    fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn set_length(&mut self, _length: u64) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn ensure_length(&mut self, length: u64) -> Result<bool> {
        Ok(length <= self.length())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.data = Vec::new();
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        true
    }
}
