//! Object cache - decoded objects held in memory by file position.
//!
//! This module provides:
//! - [`ObjectCache`] - the capacity-bounded cache with write-back
//! - [`CachedObject`] / [`ObjectHeader`] - what the cache holds
//! - [`FactoryTable`] - decoding by [`ObjectKind`](crate::ObjectKind)
//! - [`KeepGuard`] - RAII pin against eviction
//! - [`CacheStats`] - hit/miss and write-back counters

mod codec;
mod factory;
mod keep_guard;
mod object;
mod object_cache;
mod objects;
mod replacer;
mod stats;

pub use codec::{storage_size_for, RowInput, RowOutput, SIZE_PREFIX};
pub use factory::{FactoryTable, ObjectFactory};
pub use keep_guard::KeepGuard;
pub use object::{CachedObject, ObjectHeader};
pub use object_cache::{ObjectCache, RowWriter};
pub use objects::{BitMapObject, DataRow, IntArrayObject};
pub use replacer::LruReplacer;
pub use stats::{CacheStats, StatsSnapshot};
