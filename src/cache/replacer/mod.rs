//! Eviction order for the object cache.
//!
//! Currently implements:
//! - [`LruReplacer`] - least recently used first

mod lru;

pub use lru::LruReplacer;
