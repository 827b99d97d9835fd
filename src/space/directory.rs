//! Ownership of whole file blocks by table spaces.

use bitvec::prelude::*;
use tracing::debug;

use crate::common::{Error, Result, SpaceId};

use super::file_space::FileSpace;
use super::free_list::FreeList;

/// Upstream allocator that table-space managers obtain file blocks from.
pub trait SpaceDirectory: Send {
    /// Size in bytes of one file block.
    fn block_size(&self) -> u64;

    /// Hand `count` contiguous file blocks to `space` and return the byte
    /// offset of the first.
    fn get_file_blocks(&mut self, file: &mut FileSpace, space: SpaceId, count: u32) -> Result<u64>;

    /// Take back every block owned by `space`.
    fn free_table_space(&mut self, space: SpaceId);

    /// Return the ranges in `list`, plus `[offset, limit)`, to the blocks
    /// they belong to.
    ///
    /// Unless `full` is set, nothing happens while the list is less than
    /// half full after merging neighbours. The list is empty afterwards
    /// whenever ranges were returned.
    fn free_table_space_list(&mut self, list: &mut FreeList, offset: u64, limit: u64, full: bool);

    /// Bytes inside the file that no table space is using.
    fn lost_size(&self) -> u64;

    /// Block ownership and free units encoded as ints, with the byte ranges
    /// in `unused` counted as free. `None` when there is nothing to keep
    /// across a reopen.
    fn space_map(&self, _next_space_id: u32, _unused: &[(u64, u64)]) -> Option<Vec<i32>> {
        None
    }
}

/// Directory for append-only data files: blocks always come from the end of
/// the file and are never handed out twice.
#[derive(Debug)]
pub struct AppendDirectory {
    block_size: u64,
    returned: u64,
}

impl AppendDirectory {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            returned: 0,
        }
    }
}

impl SpaceDirectory for AppendDirectory {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn get_file_blocks(&mut self, file: &mut FileSpace, _space: SpaceId, count: u32) -> Result<u64> {
        file.enlarge(count as u64 * self.block_size)
    }

    fn free_table_space(&mut self, _space: SpaceId) {}

    fn free_table_space_list(&mut self, list: &mut FreeList, offset: u64, limit: u64, _full: bool) {
        self.returned += list.total_size() + limit.saturating_sub(offset);
        list.clear();
    }

    fn lost_size(&self) -> u64 {
        self.returned
    }
}

#[derive(Debug, Clone)]
struct BlockEntry {
    owner: SpaceId,
    /// One bit per scale unit, set when the unit has been returned.
    /// `None` until the first unit of the block is returned.
    free_units: Option<BitVec<u64, Lsb0>>,
}

impl BlockEntry {
    fn owned_by(owner: SpaceId) -> Self {
        Self {
            owner,
            free_units: None,
        }
    }

    fn free_unit_count(&self) -> usize {
        self.free_units.as_ref().map_or(0, |bits| bits.count_ones())
    }
}

/// Directory of fixed-size file blocks for multi-table data files.
///
/// # Layout
/// ```text
/// file:  | block 0 | block 1 | block 2 | ...
/// owner: | DEFAULT | space 9 | EMPTY   | ...
/// ```
/// Block 0 holds the file header and always belongs to the default space.
/// Blocks whose units have all been returned become `EMPTY` and are handed
/// out again before the file is enlarged.
///
/// Ownership and free units are saved with [`SpaceDirectory::space_map`]
/// and read back with [`BlockDirectory::from_space_map`]. A file opened
/// without a map starts with every existing block owned by the default
/// space.
///
/// # Space map
/// ```text
/// version | next space id | block count | units per block
/// then per block: owner | word count (0 or units/32) | free-unit words
/// ```
/// Bit `u % 32` of word `u / 32` is set when unit `u` of the block is free.
#[derive(Debug)]
pub struct BlockDirectory {
    block_size: u64,
    scale: u64,
    blocks: Vec<BlockEntry>,
}

impl BlockDirectory {
    /// Build the directory for a file whose allocated space ends at
    /// `file.free_pos()`, extending the file to a whole number of blocks.
    ///
    /// Returns the directory and the tail `[start, end)` of the last block
    /// that is still unused.
    pub fn open(file: &mut FileSpace, block_size: u64, scale: u32) -> Result<(Self, (u64, u64))> {
        let used = file.free_pos();
        let block_count = used.div_ceil(block_size).max(1);
        let end = block_count * block_size;
        file.enlarge(end - used)?;

        let directory = Self {
            block_size,
            scale: scale as u64,
            blocks: vec![BlockEntry::owned_by(SpaceId::DEFAULT); block_count as usize],
        };

        debug!(blocks = block_count, block_size, "block directory opened");
        Ok((directory, (used, end)))
    }

    /// Rebuild the directory of a file ending at `file.free_pos()` from a
    /// saved space map.
    ///
    /// Returns the directory, the next unused space id and the free ranges
    /// `(owner, offset, size)` to hand back to each table space. The
    /// rebuilt directory keeps no free units itself.
    ///
    /// # Errors
    /// `DataFileCorrupt` if the map is truncated or was written for another
    /// block size, scale or file length.
    pub fn from_space_map(
        map: &[i32],
        file: &FileSpace,
        block_size: u64,
        scale: u32,
    ) -> Result<(Self, u32, Vec<(SpaceId, u64, u64)>)> {
        let mut reader = MapReader { map, next: 0 };
        let version = reader.int()?;
        if version != SPACE_MAP_VERSION {
            return Err(map_error(format!("unknown version {}", version)));
        }
        let next_space_id = reader.count()?;
        let block_count = reader.count()?;
        let units = reader.count()?;

        let units_per_block = (block_size / scale as u64) as usize;
        if units != units_per_block {
            return Err(map_error(format!(
                "{} units per block, expected {}",
                units, units_per_block
            )));
        }
        if block_count == 0 || block_count as u64 * block_size != file.free_pos() {
            return Err(map_error(format!(
                "{} blocks do not end at {}",
                block_count,
                file.free_pos()
            )));
        }

        let mut directory = Self {
            block_size,
            scale: scale as u64,
            blocks: Vec::with_capacity(block_count),
        };
        let words_per_block = units_per_block.div_ceil(32);
        let mut free = Vec::new();
        for index in 0..block_count {
            let owner = SpaceId::new(reader.count()? as u32);
            let word_count = reader.count()?;
            if word_count != 0 && word_count != words_per_block {
                return Err(map_error(format!(
                    "block {} has {} bitmap words",
                    index, word_count
                )));
            }
            let words = reader.take(word_count)?;

            if owner != SpaceId::EMPTY && !words.is_empty() {
                let base = index as u64 * block_size;
                let mut unit = 0;
                while unit < units_per_block {
                    if !unit_is_free(words, unit) {
                        unit += 1;
                        continue;
                    }
                    let start = unit;
                    while unit < units_per_block && unit_is_free(words, unit) {
                        unit += 1;
                    }
                    free.push((
                        owner,
                        base + start as u64 * directory.scale,
                        (unit - start) as u64 * directory.scale,
                    ));
                }
            }
            directory.blocks.push(BlockEntry::owned_by(owner));
        }
        if reader.next != map.len() {
            return Err(map_error(format!(
                "{} trailing ints",
                map.len() - reader.next
            )));
        }

        debug!(
            blocks = block_count,
            free_ranges = free.len(),
            "block directory restored from space map"
        );
        Ok((directory, next_space_id as u32, free))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Owner of the block containing byte offset `position`.
    pub fn find_table_space(&self, position: u64) -> SpaceId {
        let index = (position / self.block_size) as usize;
        self.blocks
            .get(index)
            .map_or(SpaceId::DEFAULT, |block| block.owner)
    }

    pub fn owner(&self, index: usize) -> Option<SpaceId> {
        self.blocks.get(index).map(|block| block.owner)
    }

    fn units_per_block(&self) -> usize {
        (self.block_size / self.scale) as usize
    }

    fn existing_blocks(&mut self, space: SpaceId, count: u32) -> Option<usize> {
        let count = count as usize;
        let mut run_start = None;

        for index in 1..self.blocks.len() {
            if self.blocks[index].owner != SpaceId::EMPTY {
                run_start = None;
                continue;
            }
            let start = *run_start.get_or_insert(index);
            if index - start + 1 == count {
                for block in &mut self.blocks[start..=index] {
                    *block = BlockEntry::owned_by(space);
                }
                return Some(start);
            }
        }
        None
    }

    fn mark_free(&mut self, position: u64, size: u64) -> Vec<usize> {
        let units_per_block = self.units_per_block();
        let mut unit = position / self.scale;
        let mut remaining = size / self.scale;
        let mut touched = Vec::new();

        while remaining > 0 {
            let index = (unit / units_per_block as u64) as usize;
            let offset = (unit % units_per_block as u64) as usize;
            let here = (units_per_block - offset).min(remaining as usize);

            if let Some(block) = self.blocks.get_mut(index) {
                let bits = block
                    .free_units
                    .get_or_insert_with(|| bitvec![u64, Lsb0; 0; units_per_block]);
                bits[offset..offset + here].fill(true);
                touched.push(index);
            }

            unit += here as u64;
            remaining -= here as u64;
        }
        touched
    }

    fn release_empty_blocks(&mut self, touched: &[usize]) {
        let units_per_block = self.units_per_block();
        for &index in touched {
            // Block 0 carries the header and is never recycled.
            if index == 0 {
                continue;
            }
            let block = &mut self.blocks[index];
            if block.owner != SpaceId::EMPTY && block.free_unit_count() == units_per_block {
                *block = BlockEntry::owned_by(SpaceId::EMPTY);
            }
        }
    }
}

impl SpaceDirectory for BlockDirectory {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn get_file_blocks(&mut self, file: &mut FileSpace, space: SpaceId, count: u32) -> Result<u64> {
        if let Some(index) = self.existing_blocks(space, count) {
            debug!(%space, index, count, "reusing empty file blocks");
            return Ok(index as u64 * self.block_size);
        }

        let index = self.blocks.len() as u64;
        if index * self.block_size != file.free_pos() {
            return Err(Error::InvariantViolation(format!(
                "directory covers {} blocks but file space ends at {}",
                index,
                file.free_pos()
            )));
        }

        let position = file.enlarge(count as u64 * self.block_size)?;
        self.blocks
            .extend((0..count).map(|_| BlockEntry::owned_by(space)));
        Ok(position)
    }

    fn free_table_space(&mut self, space: SpaceId) {
        if space == SpaceId::DEFAULT || space == SpaceId::DIRECTORY {
            return;
        }
        for block in self.blocks.iter_mut().filter(|b| b.owner == space) {
            *block = BlockEntry::owned_by(SpaceId::EMPTY);
        }
    }

    fn free_table_space_list(&mut self, list: &mut FreeList, offset: u64, limit: u64, full: bool) {
        list.compact();
        if !full && list.len() < list.capacity() / 2 {
            return;
        }

        let ranges: Vec<(u64, u64)> = list.iter().collect();
        let mut touched = Vec::new();
        for (position, size) in ranges {
            touched.extend(self.mark_free(position, size));
        }
        if limit > offset {
            touched.extend(self.mark_free(offset, limit - offset));
        }
        touched.sort_unstable();
        touched.dedup();
        self.release_empty_blocks(&touched);

        list.clear();
    }

    fn lost_size(&self) -> u64 {
        self.blocks
            .iter()
            .map(|block| {
                if block.owner == SpaceId::EMPTY {
                    self.block_size
                } else {
                    block.free_unit_count() as u64 * self.scale
                }
            })
            .sum()
    }

    fn space_map(&self, next_space_id: u32, unused: &[(u64, u64)]) -> Option<Vec<i32>> {
        let mut snapshot = Self {
            block_size: self.block_size,
            scale: self.scale,
            blocks: self.blocks.clone(),
        };
        for &(position, size) in unused {
            snapshot.mark_free(position, size);
        }

        let units_per_block = self.units_per_block();
        let words_per_block = units_per_block.div_ceil(32);
        let mut map = vec![
            SPACE_MAP_VERSION,
            next_space_id as i32,
            snapshot.blocks.len() as i32,
            units_per_block as i32,
        ];
        for block in &snapshot.blocks {
            map.push(block.owner.0 as i32);
            match &block.free_units {
                Some(bits) if block.owner != SpaceId::EMPTY && bits.any() => {
                    map.push(words_per_block as i32);
                    let start = map.len();
                    map.resize(start + words_per_block, 0);
                    for unit in bits.iter_ones() {
                        map[start + unit / 32] |= 1i32 << (unit % 32);
                    }
                }
                _ => map.push(0),
            }
        }
        Some(map)
    }
}

const SPACE_MAP_VERSION: i32 = 1;

fn map_error(detail: String) -> Error {
    Error::DataFileCorrupt(format!("space map: {}", detail))
}

fn unit_is_free(words: &[i32], unit: usize) -> bool {
    ((words[unit / 32] as u32) >> (unit % 32)) & 1 == 1
}

/// Cursor over the ints of a space map.
struct MapReader<'a> {
    map: &'a [i32],
    next: usize,
}

impl<'a> MapReader<'a> {
    fn int(&mut self) -> Result<i32> {
        let value = *self
            .map
            .get(self.next)
            .ok_or_else(|| map_error(format!("ends after {} ints", self.next)))?;
        self.next += 1;
        Ok(value)
    }

    /// A non-negative int.
    fn count(&mut self) -> Result<usize> {
        let value = self.int()?;
        usize::try_from(value)
            .map_err(|_| map_error(format!("negative value {} at {}", value, self.next - 1)))
    }

    fn take(&mut self, len: usize) -> Result<&'a [i32]> {
        let end = self.next + len;
        let words = self
            .map
            .get(self.next..end)
            .ok_or_else(|| map_error(format!("ends inside a bitmap at {}", self.next)))?;
        self.next = end;
        Ok(words)
    }
}
