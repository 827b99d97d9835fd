//! Defragmentation: rewrite live objects into a compact new file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{error, info, warn};

use crate::common::config::{FileKind, SpacePolicy, INITIAL_FREE_POS};
use crate::common::{Error, Result, SpaceId};
use crate::space::DataSpace;
use crate::storage::{FileHeader, RandomAccess, ScaledFile};

use super::data_file::{with_suffix, DataFile, FileState, DEFRAG_SUFFIX};

/// A store whose objects can be moved by [`DataFile::defrag`].
pub trait Relocatable {
    fn space_id(&self) -> SpaceId;

    /// Positions of the store's live objects.
    fn live_positions(&self) -> Vec<u64>;

    /// How many objects the store believes it holds.
    fn expected_count(&self) -> usize;

    /// Replace every old position with its new one.
    fn relocate(&self, moved: &HashMap<u64, u64>);
}

impl DataFile {
    /// Rewrite the live objects of `stores` into a new file and swap it in.
    ///
    /// Objects of stores not listed are dropped. The stores are told their
    /// new positions once the new file is open. On any failure before the
    /// swap the temporary file is deleted and the current file is left as
    /// it was after an implicit checkpoint.
    ///
    /// Returns the number of objects moved.
    pub fn defrag(&self, stores: &[&dyn Relocatable]) -> Result<usize> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        if !self.owns_file {
            return Err(Error::InvariantViolation(
                "defrag needs a data file opened from disk".into(),
            ));
        }
        info!(path = %self.data_path.display(), stores = stores.len(), "defrag started");

        let mut state = self.state.lock();
        self.checkpoint_locked(&mut state)?;

        let new_path = with_suffix(&self.base, DEFRAG_SUFFIX);
        let maps = match self.write_compacted(&mut state, &new_path, stores) {
            Ok(maps) => maps,
            Err(e) => {
                remove_leftover(&new_path);
                warn!(error = %e, "defrag abandoned, data file unchanged");
                return Err(e.with_file(&new_path));
            }
        };

        self.cache.clear();
        if let Err(e) = self.swap_in(&mut state, &new_path) {
            remove_leftover(&new_path);
            return Err(e.with_file(&self.data_path));
        }

        let mut moved = 0;
        for (store, map) in stores.iter().zip(&maps) {
            store.relocate(map);
            moved += map.len();
        }

        info!(
            path = %self.data_path.display(),
            moved,
            free_pos = state.space.free_pos(),
            "defrag finished"
        );
        Ok(moved)
    }

    /// Close the current file and move `new_path` into its place.
    ///
    /// On failure the data file is reopened as it is on disk, so the
    /// `DataFile` stays usable.
    pub(super) fn swap_in(&self, state: &mut FileState, new_path: &Path) -> Result<()> {
        let result = self.replace_file(state, new_path);
        if let Err(e) = &result {
            warn!(error = %e, path = %self.data_path.display(), "defrag swap failed, reopening");
            match FileState::open(&self.data_path, &self.backup_path, &self.config, &self.factories) {
                Ok(reopened) => *state = reopened,
                Err(reopen) => error!(
                    error = %reopen,
                    path = %self.data_path.display(),
                    "data file left closed after failed defrag"
                ),
            }
        }
        result
    }

    fn replace_file(&self, state: &mut FileState, new_path: &Path) -> Result<()> {
        if let Some(mut channel) = state.channel.take() {
            channel.close()?;
        }
        state.discard_backup()?;
        fs::rename(new_path, &self.data_path)?;
        *state = FileState::open(&self.data_path, &self.backup_path, &self.config, &self.factories)?;
        Ok(())
    }

    /// Copy each store's objects back to back into `new_path`.
    fn write_compacted(
        &self,
        state: &mut FileState,
        new_path: &Path,
        stores: &[&dyn Relocatable],
    ) -> Result<Vec<HashMap<u64, u64>>> {
        if new_path.exists() {
            fs::remove_file(new_path)?;
        }

        let mut config = self.config.clone();
        config.space_policy = SpacePolicy::Append;
        config.file_kind = FileKind::Buffered;
        config.incremental_backup = false;
        let scale = config.data_file_scale as u64;

        let mut target = ScaledFile::open(new_path, false, &config)?;
        let mut space = DataSpace::new(&config, INITIAL_FREE_POS, 0)?;
        let mut header = FileHeader::default();
        header.write_to(&mut target)?;

        let mut maps = Vec::new();
        maps.try_reserve(stores.len())
            .map_err(|e| Error::OutOfMemory(format!("defrag store table: {}", e)))?;

        for store in stores {
            let mut positions = store.live_positions();
            positions.sort_unstable();

            let mut moved: HashMap<u64, u64> = HashMap::new();
            moved.try_reserve(positions.len()).map_err(|e| {
                Error::OutOfMemory(format!(
                    "defrag position map for {} objects: {}",
                    positions.len(),
                    e
                ))
            })?;

            for old in positions {
                let bytes = state.read_raw(old)?;
                let new = space.get_file_position(SpaceId::DEFAULT, bytes.len() as u32, false)?;
                target.seek(new * scale)?;
                target.write(&bytes)?;
                moved.insert(old, new);
            }

            if moved.len() != store.expected_count() {
                warn!(
                    space = %store.space_id(),
                    expected = store.expected_count(),
                    copied = moved.len(),
                    "row count mismatch during defrag"
                );
            }
            maps.push(moved);
        }

        header.free_pos = space.free_pos();
        header.lost_size = space.lost_size_on_close();
        header.set_saved(true);
        header.write_to(&mut target)?;
        target.sync()?;
        target.close()?;
        Ok(maps)
    }
}

fn remove_leftover(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = %path.display(), "could not delete defrag leftover");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedObject, DataRow};
    use crate::common::{ObjectKind, StoreConfig};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Minimal store keeping positions in a list.
    struct Positions {
        space: SpaceId,
        positions: Mutex<Vec<u64>>,
        claimed: usize,
    }

    impl Relocatable for Positions {
        fn space_id(&self) -> SpaceId {
            self.space
        }
        fn live_positions(&self) -> Vec<u64> {
            self.positions.lock().clone()
        }
        fn expected_count(&self) -> usize {
            self.claimed
        }
        fn relocate(&self, moved: &HashMap<u64, u64>) {
            for position in self.positions.lock().iter_mut() {
                *position = moved[&*position];
            }
        }
    }

    fn config() -> StoreConfig {
        StoreConfig::default()
            .with_data_file_scale(8)
            .with_file_block_size(4096)
    }

    fn add_rows(file: &DataFile, space: SpaceId, count: u8) -> Vec<u64> {
        (0..count)
            .map(|i| {
                let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(vec![i; 12]));
                file.add(space, Arc::clone(&row)).unwrap();
                row.position().unwrap()
            })
            .collect()
    }

    fn payload(file: &DataFile, position: u64) -> Vec<u8> {
        let row = file.get(position, ObjectKind::Row, false).unwrap();
        row.as_any().downcast_ref::<DataRow>().unwrap().payload().to_vec()
    }

    #[test]
    fn test_defrag_compacts_and_remaps() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("df"), config()).unwrap();
        let space_a = file.new_space_id();
        let space_b = file.new_space_id();
        let a = add_rows(&file, space_a, 5);
        let b = add_rows(&file, space_b, 3);
        file.remove(space_a, a[1]).unwrap();
        let kept_a: Vec<u64> = a.iter().copied().filter(|&p| p != a[1]).collect();
        let size_before = file.file_free_pos();

        let store_a = Positions {
            space: space_a,
            positions: Mutex::new(kept_a.clone()),
            claimed: 4,
        };
        let store_b = Positions {
            space: space_b,
            positions: Mutex::new(b.clone()),
            claimed: 3,
        };
        assert_eq!(file.defrag(&[&store_a, &store_b]).unwrap(), 7);
        assert!(file.file_free_pos() <= size_before);
        assert!(!dir.path().join("df.data.new").exists());

        let expected_a: Vec<u8> = vec![0, 2, 3, 4];
        for (&position, &value) in store_a.positions.lock().iter().zip(&expected_a) {
            assert_eq!(payload(&file, position), vec![value; 12]);
        }
        for (i, &position) in store_b.positions.lock().iter().enumerate() {
            assert_eq!(payload(&file, position), vec![i as u8; 12]);
        }
    }

    #[test]
    fn test_count_mismatch_does_not_abort() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("mm"), config()).unwrap();
        let positions = add_rows(&file, SpaceId::DEFAULT, 2);

        let store = Positions {
            space: SpaceId::DEFAULT,
            positions: Mutex::new(positions),
            claimed: 5,
        };
        assert_eq!(file.defrag(&[&store]).unwrap(), 2);
    }

    #[test]
    fn test_failed_swap_reopens_data_file() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("swap"), config()).unwrap();
        let positions = add_rows(&file, SpaceId::DEFAULT, 3);
        file.checkpoint().unwrap();
        file.cache().clear();

        {
            let mut state = file.state.lock();
            let missing = dir.path().join("missing.data.new");
            assert!(file.swap_in(&mut state, &missing).is_err());
            assert!(state.is_open());
        }

        for (i, &position) in positions.iter().enumerate() {
            assert_eq!(payload(&file, position), vec![i as u8; 12]);
        }
        let more = add_rows(&file, SpaceId::DEFAULT, 1);
        assert!(!positions.contains(&more[0]));
        file.close(true).unwrap();
    }

    #[test]
    fn test_failed_defrag_leaves_file_intact() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("bad"), config()).unwrap();
        let positions = add_rows(&file, SpaceId::DEFAULT, 2);

        // A position past the end of allocated space cannot be read
        let store = Positions {
            space: SpaceId::DEFAULT,
            positions: Mutex::new(vec![positions[0], 1 << 20]),
            claimed: 2,
        };
        let err = file.defrag(&[&store]).unwrap_err();
        assert!(matches!(err.root(), Error::DataFileCorrupt(_)));
        assert!(!dir.path().join("bad.data.new").exists());

        assert_eq!(payload(&file, positions[0]), vec![0; 12]);
        assert_eq!(payload(&file, positions[1]), vec![1; 12]);
    }
}
