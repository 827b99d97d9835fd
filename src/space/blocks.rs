//! Free-list allocator carving rows out of directory file blocks.

use tracing::debug;

use crate::common::config::FIXED_BLOCK_SIZE_UNIT;
use crate::common::{Result, SpaceId};
use crate::storage::binary_multiple_ceiling;

use super::free_list::FreeList;
use super::manager::{SpaceContext, TableSpaceManager};

/// Allocator for one permanent table space.
///
/// Requests are served from the free list first, then from the fresh block
/// `[fresh_free_pos, fresh_limit)`. When the fresh block is too small a new
/// run of file blocks is obtained from the directory; if it does not follow
/// on from the current block, the unused tail of the current block is
/// released into the free list.
///
/// When the free list is full, neighbours are merged. If the list is still
/// at least half full, the ranges smaller than the average request size
/// (and at least a quarter of the list) are dropped and counted as lost.
#[derive(Debug)]
pub struct BlockSpaceManager {
    space_id: SpaceId,
    scale: u64,
    main_block_size: u64,
    free_list: FreeList,
    fresh_free_pos: u64,
    fresh_limit: u64,
    lost_size: u64,
    request_count: u64,
    request_size: u64,
    modified: bool,
}

impl BlockSpaceManager {
    pub fn new(space_id: SpaceId, main_block_size: u64, capacity: usize, scale: u32) -> Self {
        Self {
            space_id,
            scale: scale as u64,
            main_block_size,
            free_list: FreeList::new(capacity),
            fresh_free_pos: 0,
            fresh_limit: 0,
            lost_size: 0,
            request_count: 0,
            request_size: 0,
            modified: false,
        }
    }

    /// Average size of the requests seen so far.
    pub fn mid_size(&self) -> u64 {
        if self.request_count == 0 {
            0
        } else {
            self.request_size / self.request_count
        }
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    fn release_bytes(&mut self, position: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.modified = true;

        if self.free_list.capacity() == 0 {
            self.lost_size += size;
            return;
        }
        if self.free_list.is_full() {
            self.reset_list();
        }
        self.free_list.add(position, size);
    }

    fn reset_list(&mut self) {
        self.free_list.compact();

        let len = self.free_list.len();
        if len < self.free_list.capacity() / 2 {
            return;
        }

        let mid_size = self.mid_size();
        let count = self
            .free_list
            .count_smaller_than(mid_size)
            .max(len / 4)
            .max(1);
        let dropped = self.free_list.remove_smallest(count);
        self.lost_size += dropped;

        debug!(
            space = %self.space_id,
            mid_size,
            count,
            dropped,
            "free list trimmed"
        );
    }

    fn get_new_block(&mut self, size: u64, as_blocks: bool, ctx: &mut SpaceContext<'_>) -> Result<u64> {
        if as_blocks {
            let aligned =
                binary_multiple_ceiling(self.fresh_free_pos, FIXED_BLOCK_SIZE_UNIT).min(self.fresh_limit);
            let gap = aligned - self.fresh_free_pos;
            let start = self.fresh_free_pos;
            self.fresh_free_pos = aligned;
            self.release_bytes(start, gap);
        }

        if size > self.fresh_limit - self.fresh_free_pos {
            self.get_new_main_block(size, ctx)?;
        }

        let position = self.fresh_free_pos;
        self.fresh_free_pos += size;
        Ok(position)
    }

    fn get_new_main_block(&mut self, size: u64, ctx: &mut SpaceContext<'_>) -> Result<()> {
        let block_count = (self.main_block_size + size) / self.main_block_size;
        let position = ctx
            .directory
            .get_file_blocks(ctx.file, self.space_id, block_count as u32)?;

        if position != self.fresh_limit {
            let tail_start = self.fresh_free_pos;
            let tail = self.fresh_limit - self.fresh_free_pos;
            self.fresh_free_pos = position;
            self.fresh_limit = position;
            self.release_bytes(tail_start, tail);
        }
        self.fresh_limit += block_count * self.main_block_size;

        debug!(
            space = %self.space_id,
            position,
            block_count,
            "new file blocks for table space"
        );
        Ok(())
    }
}

impl TableSpaceManager for BlockSpaceManager {
    fn space_id(&self) -> SpaceId {
        self.space_id
    }

    fn get_file_position(
        &mut self,
        size: u32,
        as_blocks: bool,
        ctx: &mut SpaceContext<'_>,
    ) -> Result<u64> {
        let mut size = size as u64;
        if as_blocks {
            size = binary_multiple_ceiling(size, FIXED_BLOCK_SIZE_UNIT);
        }

        self.modified = true;
        self.request_count += 1;
        self.request_size += size;

        let reused = if as_blocks {
            self.free_list.take_aligned(size, FIXED_BLOCK_SIZE_UNIT)
        } else {
            self.free_list.take(size)
        };

        let position = match reused {
            Some(position) => position,
            None => self.get_new_block(size, as_blocks, ctx)?,
        };
        Ok(position / self.scale)
    }

    fn release(&mut self, position: u64, size: u32) {
        self.release_bytes(position * self.scale, size as u64);
    }

    fn reset(&mut self, ctx: &mut SpaceContext<'_>) {
        ctx.directory.free_table_space_list(
            &mut self.free_list,
            self.fresh_free_pos,
            self.fresh_limit,
            true,
        );
        self.fresh_free_pos = 0;
        self.fresh_limit = 0;
    }

    fn add_file_block(&mut self, start: u64, limit: u64) {
        let tail_start = self.fresh_free_pos;
        let tail = self.fresh_limit - self.fresh_free_pos;
        self.fresh_free_pos = start;
        self.fresh_limit = limit;
        self.release_bytes(tail_start, tail);
    }

    fn free_block_count(&self) -> usize {
        self.free_list.len()
    }

    fn free_block_size(&self) -> u64 {
        self.free_list.total_size()
    }

    fn lost_size(&self) -> u64 {
        self.lost_size
    }

    fn fresh_remaining(&self) -> u64 {
        self.fresh_limit - self.fresh_free_pos
    }

    fn free_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges: Vec<(u64, u64)> = self.free_list.iter().collect();
        if self.fresh_limit > self.fresh_free_pos {
            ranges.push((self.fresh_free_pos, self.fresh_limit - self.fresh_free_pos));
        }
        ranges
    }

    fn is_modified(&self) -> bool {
        self.modified
    }
}
