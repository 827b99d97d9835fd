//! Row stores - the per-table face of the storage engine.
//!
//! Every table keeps its rows in one [`PersistentStore`]:
//! - [`DiskRowStore`] - rows in a [`DataFile`](crate::DataFile), cached
//! - [`MemoryRowStore`] - rows only in memory
//! - [`HybridRowStore`] - starts in memory, moves to disk once it grows
//!
//! The transaction layer reports the outcome of each row action through
//! [`PersistentStore::commit_row`] and [`PersistentStore::rollback_row`].
//! Both are provided methods, so every variant follows the same table:
//!
//! ```text
//!                    commit                    rollback
//! Delete         remove (Locks only)       reload kept, unkeep (Locks only)
//! Insert         -                         remove (Locks only)
//! InsertDelete   remove (Locks only)       remove (Locks only)
//! DeleteFinal    remove                    -
//! ```

mod disk;
mod hybrid;
mod memory;

use std::sync::Arc;

use crate::cache::CachedObject;
use crate::common::Result;

pub use disk::DiskRowStore;
pub use hybrid::HybridRowStore;
pub use memory::MemoryRowStore;

/// Which variant a store is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Disk,
    Memory,
    Hybrid,
}

/// What a transaction did to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowAction {
    Insert,
    Delete,
    /// Inserted and deleted by the same transaction.
    InsertDelete,
    /// A delete whose row can now be physically removed.
    DeleteFinal,
}

/// Concurrency control model of the owning database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxModel {
    /// Two-phase locking. Row changes are applied in place.
    #[default]
    Locks,
    /// Multi-version. Old versions stay until the version manager drops them.
    Mvcc,
}

/// Storage of the rows of one table.
pub trait PersistentStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Whether rows go through a data file and its cache.
    fn is_cached(&self) -> bool;

    /// The row at `position`, pinned if `keep` is set.
    fn get(&self, position: u64, keep: bool) -> Result<Arc<dyn CachedObject>>;

    /// The instance currently held for `object`'s position.
    fn get_object(&self, object: &dyn CachedObject, keep: bool) -> Result<Arc<dyn CachedObject>>;

    /// Store a new row, assigning its position.
    fn add(&self, object: Arc<dyn CachedObject>) -> Result<()>;

    /// Delete a row and free its space.
    fn remove(&self, object: &dyn CachedObject) -> Result<()>;

    /// Delete every row and give the table's space back.
    fn remove_all(&self) -> Result<()>;

    /// Make the row's current state durable.
    fn commit_persistence(&self, object: &Arc<dyn CachedObject>) -> Result<()>;

    fn element_count(&self) -> usize;

    /// Apply the commit of `action` on `object`.
    fn commit_row(&self, object: &dyn CachedObject, action: RowAction, tx: TxModel) -> Result<()> {
        match action {
            RowAction::Delete | RowAction::InsertDelete => {
                if tx == TxModel::Locks {
                    self.remove(object)?;
                }
            }
            RowAction::Insert => {}
            RowAction::DeleteFinal => self.remove(object)?,
        }
        Ok(())
    }

    /// Undo `action` on `object`.
    fn rollback_row(
        &self,
        object: &dyn CachedObject,
        action: RowAction,
        tx: TxModel,
    ) -> Result<()> {
        if tx != TxModel::Locks {
            return Ok(());
        }
        match action {
            RowAction::Delete => {
                let row = self.get_object(object, true)?;
                row.header().keep_in_memory(false);
            }
            RowAction::Insert | RowAction::InsertDelete => self.remove(object)?,
            RowAction::DeleteFinal => {}
        }
        Ok(())
    }
}
