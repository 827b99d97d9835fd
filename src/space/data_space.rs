//! All table-space managers of one data file, with their shared upstream.

use std::collections::HashMap;

use tracing::debug;

use crate::common::config::{SpacePolicy, StoreConfig};
use crate::common::{Error, Result, SpaceId};

use super::blocks::BlockSpaceManager;
use super::directory::{AppendDirectory, BlockDirectory, SpaceDirectory};
use super::file_space::FileSpace;
use super::manager::{SimpleSpaceManager, SpaceContext, TableSpaceManager};

/// Arena owning the file cursor, the directory and every table-space
/// manager of a data file. Stores refer to their manager by [`SpaceId`].
pub struct DataSpace {
    policy: SpacePolicy,
    scale: u32,
    block_size: u64,
    free_list_capacity: usize,
    file: FileSpace,
    directory: Box<dyn SpaceDirectory>,
    managers: HashMap<SpaceId, Box<dyn TableSpaceManager>>,
    next_space_id: u32,
    /// Lost size recorded in the file header when it was opened.
    carried_lost: u64,
    /// Allocation state changed since the last [`space_map`](Self::space_map).
    unsaved: bool,
}

impl DataSpace {
    /// Space for a file whose allocated bytes end at `free_pos`.
    ///
    /// Positions are in scale units, so the cursor starts at the next
    /// multiple of the scale.
    pub fn new(config: &StoreConfig, free_pos: u64, carried_lost: u64) -> Result<Self> {
        let scale = config.data_file_scale;
        let free_pos = free_pos.next_multiple_of(scale as u64);
        let mut file = FileSpace::new(free_pos, config.max_data_file_size);
        let mut managers: HashMap<SpaceId, Box<dyn TableSpaceManager>> = HashMap::new();

        let directory: Box<dyn SpaceDirectory> = match config.space_policy {
            SpacePolicy::Append => {
                managers.insert(
                    SpaceId::DEFAULT,
                    Box::new(SimpleSpaceManager::new(SpaceId::DEFAULT, scale)),
                );
                Box::new(AppendDirectory::new(config.file_block_size))
            }
            SpacePolicy::Blocks => {
                let (directory, (start, limit)) =
                    BlockDirectory::open(&mut file, config.file_block_size, scale)?;
                let mut default = BlockSpaceManager::new(
                    SpaceId::DEFAULT,
                    config.file_block_size,
                    config.free_list_capacity,
                    scale,
                );
                default.add_file_block(start, limit);
                managers.insert(SpaceId::DEFAULT, Box::new(default));
                Box::new(directory)
            }
        };

        Ok(Self {
            policy: config.space_policy,
            scale,
            block_size: config.file_block_size,
            free_list_capacity: config.free_list_capacity,
            file,
            directory,
            managers,
            next_space_id: SpaceId::FIRST_TABLE.0,
            carried_lost,
            unsaved: false,
        })
    }

    /// Space for a file whose block directory was saved as `map`.
    ///
    /// The free units recorded in the map go back to the free lists of
    /// their table spaces. Under the append policy the map is ignored.
    pub fn with_space_map(
        config: &StoreConfig,
        free_pos: u64,
        carried_lost: u64,
        map: &[i32],
    ) -> Result<Self> {
        if config.space_policy == SpacePolicy::Append {
            return Self::new(config, free_pos, carried_lost);
        }

        let scale = config.data_file_scale;
        let file = FileSpace::new(free_pos, config.max_data_file_size);
        let (directory, next_space_id, free) =
            BlockDirectory::from_space_map(map, &file, config.file_block_size, scale)?;

        let mut space = Self {
            policy: config.space_policy,
            scale,
            block_size: config.file_block_size,
            free_list_capacity: config.free_list_capacity,
            file,
            directory: Box::new(directory),
            managers: HashMap::new(),
            next_space_id: next_space_id.max(SpaceId::FIRST_TABLE.0),
            carried_lost,
            unsaved: false,
        };
        let default = space.new_manager(SpaceId::DEFAULT);
        space.managers.insert(SpaceId::DEFAULT, default);

        let ranges = free.len();
        for (owner, offset, size) in free {
            let size = u32::try_from(size).map_err(|_| {
                Error::DataFileCorrupt(format!("free range of {} bytes at {}", size, offset))
            })?;
            space.release(owner, offset / scale as u64, size);
        }
        space.unsaved = false;

        debug!(
            free_pos,
            spaces = space.managers.len(),
            ranges,
            "data space restored"
        );
        Ok(space)
    }
    pub fn policy(&self) -> SpacePolicy {
        self.policy
    }

    /// Byte offset of the end of allocated space.
    pub fn free_pos(&self) -> u64 {
        self.file.free_pos()
    }

    /// A table-space id not handed out before in this session.
    pub fn new_space_id(&mut self) -> SpaceId {
        let id = SpaceId::new(self.next_space_id);
        self.next_space_id += 1;
        self.unsaved = true;
        id
    }

    fn new_manager(&self, space: SpaceId) -> Box<dyn TableSpaceManager> {
        match self.policy {
            SpacePolicy::Append => Box::new(SimpleSpaceManager::new(space, self.scale)),
            SpacePolicy::Blocks => Box::new(BlockSpaceManager::new(
                space,
                self.block_size,
                self.free_list_capacity,
                self.scale,
            )),
        }
    }

    /// Run `f` on the manager of `space`, creating it on first use.
    fn with_manager<R>(
        &mut self,
        space: SpaceId,
        f: impl FnOnce(&mut dyn TableSpaceManager, &mut SpaceContext<'_>) -> R,
    ) -> R {
        if space.0 >= self.next_space_id {
            self.next_space_id = space.0 + 1;
        }
        self.unsaved = true;

        let mut manager = match self.managers.remove(&space) {
            Some(manager) => manager,
            None => self.new_manager(space),
        };
        let mut ctx = SpaceContext {
            file: &mut self.file,
            directory: self.directory.as_mut(),
        };
        let result = f(manager.as_mut(), &mut ctx);
        self.managers.insert(space, manager);
        result
    }

    /// Allocate `size` bytes for `space`, returning a position in scale units.
    pub fn get_file_position(&mut self, space: SpaceId, size: u32, as_blocks: bool) -> Result<u64> {
        self.with_manager(space, |manager, ctx| {
            manager.get_file_position(size, as_blocks, ctx)
        })
    }

    pub fn release(&mut self, space: SpaceId, position: u64, size: u32) {
        self.with_manager(space, |manager, _| manager.release(position, size));
    }

    /// Drop the manager of `space` and give all its blocks back.
    pub fn free_table_space(&mut self, space: SpaceId) {
        self.unsaved = true;
        if let Some(mut manager) = self.managers.remove(&space) {
            let mut ctx = SpaceContext {
                file: &mut self.file,
                directory: self.directory.as_mut(),
            };
            manager.reset(&mut ctx);
        }
        self.directory.free_table_space(space);

        // The default space always exists.
        if space == SpaceId::DEFAULT {
            let manager = self.new_manager(space);
            self.managers.insert(space, manager);
        }
        debug!(%space, "table space freed");
    }

    pub fn manager(&self, space: SpaceId) -> Option<&dyn TableSpaceManager> {
        self.managers.get(&space).map(|m| m.as_ref())
    }

    /// Free bytes that will not be reused in this session.
    pub fn lost_size(&self) -> u64 {
        self.carried_lost
            + self.directory.lost_size()
            + self.managers.values().map(|m| m.lost_size()).sum::<u64>()
    }

    /// Lost size to record in the header on close.
    ///
    /// Under the block policy free lists, fresh blocks and empty blocks
    /// are saved in the space map, so only dropped ranges count. Under the
    /// append policy nothing is reused after a reopen.
    pub fn lost_size_on_close(&self) -> u64 {
        match self.policy {
            SpacePolicy::Blocks => {
                self.carried_lost + self.managers.values().map(|m| m.lost_size()).sum::<u64>()
            }
            SpacePolicy::Append => {
                self.lost_size()
                    + self
                        .managers
                        .values()
                        .map(|m| m.free_block_size() + m.fresh_remaining())
                        .sum::<u64>()
            }
        }
    }

    /// The block directory with every manager's reusable ranges, ready to
    /// be stored in the file. `None` under the append policy.
    pub fn space_map(&mut self) -> Option<Vec<i32>> {
        let unused: Vec<(u64, u64)> = self
            .managers
            .values()
            .flat_map(|m| m.free_ranges())
            .collect();
        let map = self.directory.space_map(self.next_space_id, &unused)?;
        self.unsaved = false;
        Some(map)
    }

    /// Whether allocations happened since the last [`space_map`](Self::space_map).
    pub fn is_unsaved(&self) -> bool {
        self.unsaved
    }

    pub fn is_modified(&self) -> bool {
        self.managers.values().any(|m| m.is_modified())
    }

    pub fn free_block_count(&self) -> usize {
        self.managers.values().map(|m| m.free_block_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::INITIAL_FREE_POS;

    fn blocks_config() -> StoreConfig {
        StoreConfig::default()
            .with_data_file_scale(8)
            .with_file_block_size(4096)
    }

    #[test]
    fn test_default_space_starts_after_header() {
        let mut space = DataSpace::new(&blocks_config(), INITIAL_FREE_POS, 0).unwrap();

        let position = space.get_file_position(SpaceId::DEFAULT, 64, false).unwrap();
        assert_eq!(position * 8, INITIAL_FREE_POS);
        assert_eq!(space.free_pos(), 4096);
    }

    #[test]
    fn test_table_spaces_get_own_blocks() {
        let mut space = DataSpace::new(&blocks_config(), INITIAL_FREE_POS, 0).unwrap();
        let a = space.new_space_id();
        let b = space.new_space_id();
        assert_eq!(a, SpaceId::FIRST_TABLE);

        let pa = space.get_file_position(a, 64, false).unwrap();
        let pb = space.get_file_position(b, 64, false).unwrap();
        assert_eq!(pa * 8, 4096);
        assert_eq!(pb * 8, 8192);
    }

    #[test]
    fn test_freed_space_blocks_are_reused() {
        let mut space = DataSpace::new(&blocks_config(), INITIAL_FREE_POS, 0).unwrap();
        let a = space.new_space_id();
        space.get_file_position(a, 64, false).unwrap();
        space.free_table_space(a);
        assert!(space.manager(a).is_none());
        assert_eq!(space.lost_size(), 4096);

        let b = space.new_space_id();
        assert_eq!(space.get_file_position(b, 64, false).unwrap() * 8, 4096);
        assert_eq!(space.free_pos(), 8192);
    }

    #[test]
    fn test_append_policy() {
        let config = StoreConfig::temporary().with_data_file_scale(8);
        let mut space = DataSpace::new(&config, INITIAL_FREE_POS, 0).unwrap();

        assert_eq!(space.get_file_position(SpaceId::DEFAULT, 64, false).unwrap(), 4);
        space.release(SpaceId::DEFAULT, 4, 64);
        assert_eq!(space.get_file_position(SpaceId::DEFAULT, 64, false).unwrap(), 12);
        assert_eq!(space.lost_size(), 64);
    }

    #[test]
    fn test_close_keeps_reusable_space_out_of_lost() {
        let mut space = DataSpace::new(&blocks_config(), INITIAL_FREE_POS, 100).unwrap();
        let p = space.get_file_position(SpaceId::DEFAULT, 64, false).unwrap();
        space.release(SpaceId::DEFAULT, p, 64);

        assert_eq!(space.lost_size(), 100);
        assert_eq!(space.lost_size_on_close(), 100);
    }

    #[test]
    fn test_append_close_counts_untracked_space() {
        let config = StoreConfig::temporary().with_data_file_scale(8);
        let mut space = DataSpace::new(&config, INITIAL_FREE_POS, 100).unwrap();
        let p = space.get_file_position(SpaceId::DEFAULT, 64, false).unwrap();
        space.release(SpaceId::DEFAULT, p, 64);

        assert_eq!(space.lost_size_on_close(), 164);
        assert!(space.space_map().is_none());
    }

    #[test]
    fn test_space_map_restores_free_lists() {
        let config = blocks_config();
        let mut space = DataSpace::new(&config, INITIAL_FREE_POS, 0).unwrap();
        let table = space.new_space_id();
        let positions: Vec<u64> = (0..4)
            .map(|_| space.get_file_position(table, 64, false).unwrap())
            .collect();
        space.release(table, positions[1], 64);
        let free_pos = space.free_pos();

        assert!(space.is_unsaved());
        let map = space.space_map().unwrap();
        assert!(!space.is_unsaved());

        let mut restored = DataSpace::with_space_map(&config, free_pos, 0, &map).unwrap();
        assert!(!restored.is_unsaved());
        assert_eq!(restored.free_pos(), free_pos);
        // The released slot comes back first, then the rest of the block
        assert_eq!(restored.get_file_position(table, 64, false).unwrap(), positions[1]);
        assert_eq!(
            restored.get_file_position(table, 64, false).unwrap(),
            positions[3] + 8
        );
        assert_eq!(restored.free_pos(), free_pos);
        // Ids handed out before the reopen are not reused
        assert_eq!(restored.new_space_id(), SpaceId::new(table.0 + 1));
    }

    #[test]
    fn test_space_map_for_other_file_is_rejected() {
        let config = blocks_config();
        let mut space = DataSpace::new(&config, INITIAL_FREE_POS, 0).unwrap();
        let map = space.space_map().unwrap();

        let result = DataSpace::with_space_map(&config, 8192, 0, &map);
        assert!(matches!(result, Err(Error::DataFileCorrupt(_))));
    }

    #[test]
    fn test_start_aligned_to_large_scale() {
        let config = StoreConfig::default().with_data_file_scale(64);
        let mut space = DataSpace::new(&config, INITIAL_FREE_POS, 0).unwrap();

        assert_eq!(space.get_file_position(SpaceId::DEFAULT, 64, false).unwrap(), 1);
    }

    #[test]
    fn test_space_ids_follow_seen_ids() {
        let mut space = DataSpace::new(&blocks_config(), INITIAL_FREE_POS, 0).unwrap();
        space.release(SpaceId::new(20), 0, 0);
        assert_eq!(space.new_space_id(), SpaceId::new(21));
    }
}
