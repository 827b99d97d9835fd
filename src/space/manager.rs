//! The per-table allocator contract and its append-only implementation.

use crate::common::{Result, SpaceId};

use super::directory::SpaceDirectory;
use super::file_space::FileSpace;

/// Shared upstream state lent to a table-space manager for one call.
pub struct SpaceContext<'a> {
    pub file: &'a mut FileSpace,
    pub directory: &'a mut dyn SpaceDirectory,
}

/// Hands out and takes back space for the objects of one table space.
///
/// Positions are in scale units (byte offset divided by the data file
/// scale). Sizes are in bytes and always a multiple of the scale.
pub trait TableSpaceManager: Send {
    fn space_id(&self) -> SpaceId;

    /// Find room for `size` bytes.
    ///
    /// With `as_blocks` the size is rounded up to the fixed block unit and
    /// the returned position is aligned to it.
    fn get_file_position(
        &mut self,
        size: u32,
        as_blocks: bool,
        ctx: &mut SpaceContext<'_>,
    ) -> Result<u64>;

    /// Make `size` bytes at `position` available again.
    fn release(&mut self, position: u64, size: u32);

    /// Return the free list and the unused part of the current block to
    /// the directory.
    fn reset(&mut self, ctx: &mut SpaceContext<'_>);

    /// Use `[start, limit)` (byte offsets) as the current fresh block.
    fn add_file_block(&mut self, start: u64, limit: u64);

    /// Number of tracked free ranges.
    fn free_block_count(&self) -> usize;

    /// Total bytes in tracked free ranges.
    fn free_block_size(&self) -> u64;

    /// Bytes released but no longer tracked for reuse.
    fn lost_size(&self) -> u64;

    /// Bytes left in the current fresh block.
    fn fresh_remaining(&self) -> u64;

    /// Byte ranges `(offset, size)` this manager would hand out again: the
    /// free list followed by the rest of the fresh block.
    fn free_ranges(&self) -> Vec<(u64, u64)>;

    fn is_modified(&self) -> bool;
}

/// Append-only manager: every allocation extends the file.
///
/// Released space is never reused; it is only counted as lost.
#[derive(Debug)]
pub struct SimpleSpaceManager {
    space_id: SpaceId,
    scale: u64,
    lost_size: u64,
    modified: bool,
}

impl SimpleSpaceManager {
    pub fn new(space_id: SpaceId, scale: u32) -> Self {
        Self {
            space_id,
            scale: scale as u64,
            lost_size: 0,
            modified: false,
        }
    }
}

impl TableSpaceManager for SimpleSpaceManager {
    fn space_id(&self) -> SpaceId {
        self.space_id
    }

    fn get_file_position(
        &mut self,
        size: u32,
        _as_blocks: bool,
        ctx: &mut SpaceContext<'_>,
    ) -> Result<u64> {
        let position = ctx.file.enlarge(size as u64)?;
        self.modified = true;
        Ok(position / self.scale)
    }

    fn release(&mut self, _position: u64, size: u32) {
        self.lost_size += size as u64;
        self.modified = true;
    }

    fn reset(&mut self, _ctx: &mut SpaceContext<'_>) {}

    fn add_file_block(&mut self, start: u64, limit: u64) {
        self.lost_size += limit.saturating_sub(start);
    }

    fn free_block_count(&self) -> usize {
        0
    }

    fn free_block_size(&self) -> u64 {
        0
    }

    fn lost_size(&self) -> u64 {
        self.lost_size
    }

    fn fresh_remaining(&self) -> u64 {
        0
    }

    fn free_ranges(&self) -> Vec<(u64, u64)> {
        Vec::new()
    }

    fn is_modified(&self) -> bool {
        self.modified
    }
}
