//! Row store that moves from memory to disk once it grows.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::cache::CachedObject;
use crate::common::{ObjectKind, Result, SpaceId};
use crate::persist::{DataFile, Relocatable};

use super::disk::DiskRowStore;
use super::memory::MemoryRowStore;
use super::{PersistentStore, StoreKind};

enum Backing {
    Memory(MemoryRowStore),
    Disk(DiskRowStore),
}

impl Backing {
    fn store(&self) -> &dyn PersistentStore {
        match self {
            Backing::Memory(store) => store,
            Backing::Disk(store) => store,
        }
    }
}

/// Result and temporary table store.
///
/// Rows start in memory. Adding a row when `max_memory_rows` are already
/// held moves every row to a table space of the data file first. The move
/// is one way. Moved rows get new positions, so callers holding a row
/// should look it up again with [`get_object`](PersistentStore::get_object).
pub struct HybridRowStore {
    backing: RwLock<Backing>,
    file: Arc<DataFile>,
    kind: ObjectKind,
    max_memory_rows: usize,
}

impl HybridRowStore {
    pub fn new(file: Arc<DataFile>, kind: ObjectKind, max_memory_rows: usize) -> Self {
        Self {
            backing: RwLock::new(Backing::Memory(MemoryRowStore::new())),
            file,
            kind,
            max_memory_rows,
        }
    }

    /// Move all rows to the data file now. Does nothing if already moved.
    pub fn change_to_disk(&self) -> Result<()> {
        let mut backing = self.backing.write();
        if let Backing::Memory(memory) = &*backing {
            let disk = self.migrate(memory)?;
            *backing = Backing::Disk(disk);
        }
        Ok(())
    }

    fn migrate(&self, memory: &MemoryRowStore) -> Result<DiskRowStore> {
        let disk = DiskRowStore::new(Arc::clone(&self.file), self.kind);
        let rows = memory.rows();
        let old_positions: Vec<Option<u64>> = rows.iter().map(|row| row.position()).collect();

        for (moved, row) in rows.iter().enumerate() {
            row.header().set_in_memory(false);
            if let Err(e) = disk.add(Arc::clone(row)) {
                warn!(error = %e, moved, "moving rows to disk failed, staying in memory");
                // Give the rows their memory positions back
                if let Err(cleanup) = disk.remove_all() {
                    warn!(error = %cleanup, space = %disk.space_id(), "freeing half-moved rows failed");
                }
                for (row, position) in rows.iter().zip(&old_positions) {
                    if let Some(position) = position {
                        row.header().set_position(*position);
                    }
                    row.header().set_in_memory(true);
                }
                return Err(e);
            }
        }

        info!(rows = rows.len(), space = %disk.space_id(), "hybrid store moved to disk");
        Ok(disk)
    }
}

impl PersistentStore for HybridRowStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Hybrid
    }

    fn is_cached(&self) -> bool {
        matches!(&*self.backing.read(), Backing::Disk(_))
    }

    fn get(&self, position: u64, keep: bool) -> Result<Arc<dyn CachedObject>> {
        self.backing.read().store().get(position, keep)
    }

    fn get_object(&self, object: &dyn CachedObject, keep: bool) -> Result<Arc<dyn CachedObject>> {
        self.backing.read().store().get_object(object, keep)
    }

    fn add(&self, object: Arc<dyn CachedObject>) -> Result<()> {
        let mut backing = self.backing.write();
        if let Backing::Memory(memory) = &*backing {
            if memory.element_count() >= self.max_memory_rows {
                let disk = self.migrate(memory)?;
                *backing = Backing::Disk(disk);
            }
        }
        backing.store().add(object)
    }

    fn remove(&self, object: &dyn CachedObject) -> Result<()> {
        self.backing.read().store().remove(object)
    }

    fn remove_all(&self) -> Result<()> {
        self.backing.read().store().remove_all()
    }

    fn commit_persistence(&self, object: &Arc<dyn CachedObject>) -> Result<()> {
        self.backing.read().store().commit_persistence(object)
    }

    fn element_count(&self) -> usize {
        self.backing.read().store().element_count()
    }
}

impl Relocatable for HybridRowStore {
    fn space_id(&self) -> SpaceId {
        match &*self.backing.read() {
            Backing::Disk(disk) => disk.space_id(),
            Backing::Memory(_) => SpaceId::EMPTY,
        }
    }

    fn live_positions(&self) -> Vec<u64> {
        match &*self.backing.read() {
            Backing::Disk(disk) => disk.live_positions(),
            Backing::Memory(_) => Vec::new(),
        }
    }

    fn expected_count(&self) -> usize {
        match &*self.backing.read() {
            Backing::Disk(disk) => disk.expected_count(),
            Backing::Memory(_) => 0,
        }
    }

    fn relocate(&self, moved: &HashMap<u64, u64>) {
        if let Backing::Disk(disk) = &*self.backing.read() {
            disk.relocate(moved);
        }
    }
}
