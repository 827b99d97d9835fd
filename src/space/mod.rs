//! Free-space management inside a data file.
//!
//! - [`FileSpace`] - End-of-file cursor
//! - [`FreeList`] - Reusable ranges of one table space
//! - [`TableSpaceManager`] - Per-table allocator ([`SimpleSpaceManager`], [`BlockSpaceManager`])
//! - [`SpaceDirectory`] - Upstream source of file blocks ([`BlockDirectory`], [`AppendDirectory`])
//! - [`DataSpace`] - Arena tying them together for one data file

mod blocks;
mod data_space;
mod directory;
mod file_space;
mod free_list;
mod manager;

pub use blocks::BlockSpaceManager;
pub use data_space::DataSpace;
pub use directory::{AppendDirectory, BlockDirectory, SpaceDirectory};
pub use file_space::FileSpace;
pub use free_list::FreeList;
pub use manager::{SimpleSpaceManager, SpaceContext, TableSpaceManager};
