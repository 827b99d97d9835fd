//! cachestore - the disk-backed storage engine of an embedded relational database.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Row stores (store/)                          │
//! │       DiskRowStore  |  MemoryRowStore  |  HybridRowStore        │
//! │          commit / rollback state table per row action           │
//! └─────────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    DataFile (persist/)                          │
//! │   ┌──────────────────┐   ┌──────────────────┐                   │
//! │   │   ObjectCache    │   │    DataSpace     │   defrag,         │
//! │   │  (cache/) LRU +  │   │ (space/) simple  │   checkpoint,     │
//! │   │  sorted write-   │   │ or block free-   │   recovery        │
//! │   │  back            │   │ space allocator  │                   │
//! │   └──────────────────┘   └──────────────────┘                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌──────────────────────────────────┐  ┌──────────────────────────┐
//! │   RandomAccess (storage/)        │  │  ShadowJournal (shadow/) │
//! │ buffered | mapped | hybrid | ro  │→ │ page pre-images for      │
//! │ + 32-byte FileHeader             │  │ rollback to checkpoint   │
//! └──────────────────────────────────┘  └──────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Configuration, errors, identifiers
//! - [`storage`] - Positional file channels and the file header
//! - [`shadow`] - Incremental backup journal and its page bitmap
//! - [`space`] - Free-space allocation inside a data file
//! - [`cache`] - Decoded objects held in memory by file position
//! - [`persist`] - The data file tying the layers together
//! - [`store`] - Per-table row stores
//!
//! # Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use cachestore::{CachedObject, DataFile, DataRow, ObjectKind, StoreConfig};
//! use cachestore::store::{DiskRowStore, PersistentStore};
//!
//! let file = Arc::new(DataFile::open("my_database", StoreConfig::default()).unwrap());
//! let table = DiskRowStore::new(Arc::clone(&file), ObjectKind::Row);
//!
//! let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(b"hello".to_vec()));
//! table.add(Arc::clone(&row)).unwrap();
//! file.checkpoint().unwrap();
//! file.close(true).unwrap();
//! ```

pub mod cache;
pub mod common;
pub mod persist;
pub mod shadow;
pub mod space;
pub mod storage;
pub mod store;

// Re-export commonly used items at crate root for convenience
pub use common::{Error, ObjectKind, Result, SpaceId, StoreConfig};

pub use cache::{CachedObject, DataRow, KeepGuard, ObjectCache, ObjectHeader, StatsSnapshot};
pub use persist::{DataFile, Relocatable};
pub use store::{PersistentStore, RowAction, StoreKind, TxModel};
