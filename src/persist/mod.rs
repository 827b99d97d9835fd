//! Persistence - the data file that ties cache, allocators and channel
//! together.
//!
//! - [`DataFile`] - open, read, write, checkpoint and recover one file
//! - [`Relocatable`] - stores whose objects [`DataFile::defrag`] can move

mod data_file;
mod defrag;

pub use data_file::{DataFile, BACKUP_SUFFIX, DATA_SUFFIX, DEFRAG_SUFFIX};
pub use defrag::Relocatable;
