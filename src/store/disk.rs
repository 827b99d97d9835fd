//! Row store backed by a data file.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::CachedObject;
use crate::common::{Error, ObjectKind, Result, SpaceId};
use crate::persist::{DataFile, Relocatable};

use super::{PersistentStore, StoreKind};

/// The rows of one table, kept in their own table space of a data file.
///
/// The store only tracks which positions are live. The objects themselves
/// live in the data file's cache or on disk.
pub struct DiskRowStore {
    file: Arc<DataFile>,
    space: SpaceId,
    kind: ObjectKind,
    positions: Mutex<BTreeSet<u64>>,
}

impl DiskRowStore {
    /// An empty store in a new table space of `file`.
    pub fn new(file: Arc<DataFile>, kind: ObjectKind) -> Self {
        let space = file.new_space_id();
        Self::with_positions(file, space, kind, std::iter::empty())
    }

    /// A store over rows already in the file, e.g. after a reopen.
    pub fn with_positions(
        file: Arc<DataFile>,
        space: SpaceId,
        kind: ObjectKind,
        positions: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            file,
            space,
            kind,
            positions: Mutex::new(positions.into_iter().collect()),
        }
    }

    pub fn space_id(&self) -> SpaceId {
        self.space
    }

    pub fn file(&self) -> &Arc<DataFile> {
        &self.file
    }

    /// Live positions in ascending order.
    pub fn positions(&self) -> Vec<u64> {
        self.positions.lock().iter().copied().collect()
    }
}

impl PersistentStore for DiskRowStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Disk
    }

    fn is_cached(&self) -> bool {
        true
    }

    fn get(&self, position: u64, keep: bool) -> Result<Arc<dyn CachedObject>> {
        self.file.get(position, self.kind, keep)
    }

    fn get_object(&self, object: &dyn CachedObject, keep: bool) -> Result<Arc<dyn CachedObject>> {
        self.file.get_object(object, keep)
    }

    fn add(&self, object: Arc<dyn CachedObject>) -> Result<()> {
        let placed = Arc::clone(&object);
        self.file.add(self.space, object)?;
        if let Some(position) = placed.position() {
            self.positions.lock().insert(position);
        }
        Ok(())
    }

    fn remove(&self, object: &dyn CachedObject) -> Result<()> {
        let position = object.position().ok_or_else(|| {
            Error::InvariantViolation("cannot remove a row that was never stored".into())
        })?;
        if !self.positions.lock().remove(&position) {
            debug!(space = %self.space, position, "row already removed");
            return Ok(());
        }
        self.file.remove(self.space, position)
    }

    fn remove_all(&self) -> Result<()> {
        let positions = std::mem::take(&mut *self.positions.lock());
        for position in &positions {
            self.file.cache().release(*position);
        }
        self.file.free_table_space(self.space);
        debug!(space = %self.space, rows = positions.len(), "table space emptied");
        Ok(())
    }

    fn commit_persistence(&self, object: &Arc<dyn CachedObject>) -> Result<()> {
        if object.header().is_changed() {
            self.file.save_row(object)?;
        }
        Ok(())
    }

    fn element_count(&self) -> usize {
        self.positions.lock().len()
    }
}

impl Relocatable for DiskRowStore {
    fn space_id(&self) -> SpaceId {
        self.space
    }

    fn live_positions(&self) -> Vec<u64> {
        self.positions()
    }

    fn expected_count(&self) -> usize {
        self.element_count()
    }

    fn relocate(&self, moved: &HashMap<u64, u64>) {
        let mut positions = self.positions.lock();
        *positions = positions
            .iter()
            .filter_map(|old| moved.get(old).copied())
            .collect();
    }
}
