//! Storage layer - positional file I/O and the data-file header.
//!
//! This module handles persistent storage:
//! - [`RandomAccess`] - The channel contract every backend implements
//! - [`ScaledFile`], [`MappedFile`], [`HybridFile`], [`ReadOnlyImage`] - Backends
//! - [`FileHeader`] - The 32-byte header at the start of a data file

mod channel;
mod header;
mod hybrid_file;
mod mapped_file;
mod read_only;
mod scaled_file;

pub(crate) use channel::closed_error;
pub use channel::{binary_multiple_ceiling, extended_length, open_channel, RandomAccess};
pub use header::FileHeader;
pub use hybrid_file::HybridFile;
pub use mapped_file::MappedFile;
pub use read_only::ReadOnlyImage;
pub use scaled_file::ScaledFile;
