//! Row store that never touches a file.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::CachedObject;
use crate::common::{Error, Result};

use super::{PersistentStore, StoreKind};

/// Rows held in memory only, addressed by a sequence number.
///
/// Positions are handed out in increasing order and never reused.
#[derive(Default)]
pub struct MemoryRowStore {
    rows: RwLock<BTreeMap<u64, Arc<dyn CachedObject>>>,
    next_position: AtomicU64,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows in position order.
    pub fn rows(&self) -> Vec<Arc<dyn CachedObject>> {
        self.rows.read().values().cloned().collect()
    }
}

impl PersistentStore for MemoryRowStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    fn is_cached(&self) -> bool {
        false
    }

    fn get(&self, position: u64, keep: bool) -> Result<Arc<dyn CachedObject>> {
        let rows = self.rows.read();
        let row = rows.get(&position).ok_or_else(|| {
            Error::InvariantViolation(format!("no row at memory position {}", position))
        })?;
        if keep {
            row.header().keep_in_memory(true);
        }
        Ok(Arc::clone(row))
    }

    fn get_object(&self, object: &dyn CachedObject, keep: bool) -> Result<Arc<dyn CachedObject>> {
        let position = object.position().ok_or_else(|| {
            Error::InvariantViolation("row was never added to this store".into())
        })?;
        self.get(position, keep)
    }

    fn add(&self, object: Arc<dyn CachedObject>) -> Result<()> {
        let position = self.next_position.fetch_add(1, Ordering::Relaxed);
        let header = object.header();
        header.set_position(position);
        header.set_in_memory(true);
        self.rows.write().insert(position, object);
        Ok(())
    }

    fn remove(&self, object: &dyn CachedObject) -> Result<()> {
        if let Some(position) = object.position() {
            if let Some(row) = self.rows.write().remove(&position) {
                row.header().set_in_memory(false);
            }
        }
        Ok(())
    }

    fn remove_all(&self) -> Result<()> {
        let mut rows = self.rows.write();
        for row in rows.values() {
            row.header().set_in_memory(false);
        }
        rows.clear();
        Ok(())
    }

    fn commit_persistence(&self, _object: &Arc<dyn CachedObject>) -> Result<()> {
        Ok(())
    }

    fn element_count(&self) -> usize {
        self.rows.read().len()
    }
}
