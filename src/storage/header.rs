//! The fixed header at the start of every data file.

use crate::common::config::INITIAL_FREE_POS;
use crate::common::{Error, Result};

use super::channel::RandomAccess;

/// Metadata stored in the first [`INITIAL_FREE_POS`] bytes of a data file.
///
/// # Layout (32 bytes, big-endian)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     checksum (CRC32 of bytes 4..32)
/// 4       8     lost_size
/// 12      8     free_pos
/// 20      8     space_map
/// 28      4     flags
/// ```
///
/// The header is rewritten at every checkpoint and clean close. A file whose
/// header lacks [`FLAG_SAVED`](Self::FLAG_SAVED) was not closed cleanly, and
/// its space map is not trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Free bytes that cannot be reused until the next defrag.
    pub lost_size: u64,
    /// Byte offset of the end of allocated space.
    pub free_pos: u64,
    /// Byte offset of the saved block directory, zero if there is none.
    pub space_map: u64,
    pub flags: u32,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            lost_size: 0,
            free_pos: INITIAL_FREE_POS,
            space_map: 0,
            flags: 0,
        }
    }
}

impl FileHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = INITIAL_FREE_POS as usize;

    pub const OFFSET_CHECKSUM: usize = 0;
    pub const OFFSET_LOST_SIZE: usize = 4;
    pub const OFFSET_FREE_POS: usize = 12;
    pub const OFFSET_SPACE_MAP: usize = 20;
    pub const OFFSET_FLAGS: usize = 28;

    /// Set when the file was closed or checkpointed cleanly.
    pub const FLAG_SAVED: u32 = 1 << 2;

    pub fn is_saved(&self) -> bool {
        self.flags & Self::FLAG_SAVED != 0
    }

    pub fn set_saved(&mut self, saved: bool) {
        if saved {
            self.flags |= Self::FLAG_SAVED;
        } else {
            self.flags &= !Self::FLAG_SAVED;
        }
    }

    /// Encode, including the checksum.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[Self::OFFSET_LOST_SIZE..Self::OFFSET_LOST_SIZE + 8]
            .copy_from_slice(&self.lost_size.to_be_bytes());
        data[Self::OFFSET_FREE_POS..Self::OFFSET_FREE_POS + 8]
            .copy_from_slice(&self.free_pos.to_be_bytes());
        data[Self::OFFSET_SPACE_MAP..Self::OFFSET_SPACE_MAP + 8]
            .copy_from_slice(&self.space_map.to_be_bytes());
        data[Self::OFFSET_FLAGS..Self::OFFSET_FLAGS + 4].copy_from_slice(&self.flags.to_be_bytes());

        let checksum = Self::compute_checksum(&data);
        data[Self::OFFSET_CHECKSUM..Self::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&checksum.to_be_bytes());
        data
    }

    /// Decode and verify the checksum.
    ///
    /// # Errors
    /// `DataFileCorrupt` if the checksum does not match or `free_pos` lies
    /// inside the header.
    pub fn from_bytes(data: &[u8; Self::SIZE]) -> Result<Self> {
        let stored = u32::from_be_bytes(read_array(data, Self::OFFSET_CHECKSUM));
        let computed = Self::compute_checksum(data);
        if stored != computed {
            return Err(Error::DataFileCorrupt(format!(
                "header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        let header = Self {
            lost_size: u64::from_be_bytes(read_array(data, Self::OFFSET_LOST_SIZE)),
            free_pos: u64::from_be_bytes(read_array(data, Self::OFFSET_FREE_POS)),
            space_map: u64::from_be_bytes(read_array(data, Self::OFFSET_SPACE_MAP)),
            flags: u32::from_be_bytes(read_array(data, Self::OFFSET_FLAGS)),
        };

        if header.free_pos < INITIAL_FREE_POS {
            return Err(Error::DataFileCorrupt(format!(
                "free position {} inside header",
                header.free_pos
            )));
        }
        if header.space_map != 0 && header.space_map < header.free_pos {
            return Err(Error::DataFileCorrupt(format!(
                "space map at {} overlaps allocated space ending at {}",
                header.space_map, header.free_pos
            )));
        }
        Ok(header)
    }

    /// CRC32 of everything after the checksum field.
    pub fn compute_checksum(data: &[u8; Self::SIZE]) -> u32 {
        crc32fast::hash(&data[Self::OFFSET_CHECKSUM + 4..])
    }

    pub fn read_from(channel: &mut dyn RandomAccess) -> Result<Self> {
        if channel.length() < Self::SIZE as u64 {
            return Err(Error::DataFileCorrupt(format!(
                "file of {} bytes is shorter than the header",
                channel.length()
            )));
        }
        let mut data = [0u8; Self::SIZE];
        channel.seek(0)?;
        channel.read(&mut data)?;
        Self::from_bytes(&data)
    }

    pub fn write_to(&self, channel: &mut dyn RandomAccess) -> Result<()> {
        channel.seek(0)?;
        channel.write(&self.to_bytes())
    }
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}
