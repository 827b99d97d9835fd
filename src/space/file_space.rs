//! The end-of-file cursor every allocation ultimately comes from.

use crate::common::{Error, Result};

/// Tracks the end of allocated space in a data file.
///
/// Positions here are byte offsets. The cursor only moves forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpace {
    free_pos: u64,
    max_size: u64,
}

impl FileSpace {
    pub fn new(free_pos: u64, max_size: u64) -> Self {
        Self { free_pos, max_size }
    }

    /// Byte offset of the first unallocated byte.
    #[inline]
    pub fn free_pos(&self) -> u64 {
        self.free_pos
    }

    #[inline]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Reserve `size` bytes at the end of the file and return where they start.
    ///
    /// # Errors
    /// `FileFull` if the file would grow past its maximum size. The cursor
    /// is unchanged in that case.
    pub fn enlarge(&mut self, size: u64) -> Result<u64> {
        let requested = self.free_pos + size;
        if requested > self.max_size {
            return Err(Error::FileFull {
                requested,
                max: self.max_size,
            });
        }

        let position = self.free_pos;
        self.free_pos = requested;
        Ok(position)
    }
}
