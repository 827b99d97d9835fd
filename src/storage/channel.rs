//! The random-access channel contract and backend selection.

use std::path::Path;

use crate::common::config::{FileKind, StoreConfig};
use crate::common::{Error, Result};

use super::hybrid_file::HybridFile;
use super::mapped_file::MappedFile;
use super::scaled_file::ScaledFile;

/// Positional I/O over a backing store.
///
/// Every backend (buffered file, memory map, hybrid, read-only image or a
/// client-supplied storage) satisfies the same contract. Reads and writes
/// start at the current position and advance it. Integers are big-endian.
///
/// # Failure semantics
/// A failed operation leaves the channel usable. Backends invalidate their
/// internal buffers and return the original error; nothing is closed
/// implicitly.
pub trait RandomAccess: Send {
    /// Current length of the backing store in bytes.
    fn length(&self) -> u64;

    /// Move the position used by the next read or write.
    fn seek(&mut self, position: u64) -> Result<()>;

    /// Current position.
    fn position(&self) -> u64;

    /// Fill `buf` from the current position.
    ///
    /// # Errors
    /// Reading past the end of the store is an I/O error, never a silent
    /// zero fill.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at the current position.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    fn read_int(&mut self) -> Result<i32> {
        let mut scratch = [0u8; 4];
        self.read(&mut scratch)?;
        Ok(i32::from_be_bytes(scratch))
    }

    fn read_long(&mut self) -> Result<i64> {
        let mut scratch = [0u8; 8];
        self.read(&mut scratch)?;
        Ok(i64::from_be_bytes(scratch))
    }

    fn write_int(&mut self, value: i32) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    fn write_long(&mut self, value: i64) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    /// Truncate or extend to exactly `length` bytes.
    fn set_length(&mut self, length: u64) -> Result<()>;

    /// Make sure the store is at least `length` bytes long.
    ///
    /// Returns `false` when this backend cannot grow that far.
    fn ensure_length(&mut self, length: u64) -> Result<bool>;

    /// Force written data to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Release the backing resource. Further I/O fails.
    fn close(&mut self) -> Result<()>;

    fn is_read_only(&self) -> bool;

    /// Whether the data currently lives in a memory map.
    fn is_mapped(&self) -> bool {
        false
    }
}

/// Round `value` up to a multiple of `unit`, which must be a power of two.
#[inline]
pub fn binary_multiple_ceiling(value: u64, unit: u64) -> u64 {
    debug_assert!(unit.is_power_of_two());
    (value + unit - 1) & !(unit - 1)
}

/// Length a growing file is extended to when `length` bytes are needed.
///
/// Small files grow by small steps and large files by large ones:
///
/// ```text
/// needed length     rounded to a multiple of
/// -------------     ------------------------
/// < 256KB           buffer << 2
/// < 1MB             buffer << 6
/// < 32MB            buffer << 8
/// otherwise         buffer << 12
/// ```
///
/// # Example
/// ```
/// use cachestore::storage::extended_length;
///
/// // 4KB buffer: 300000 bytes round up to a multiple of 256KB.
/// assert_eq!(extended_length(300_000, 12), 524_288);
/// ```
pub fn extended_length(length: u64, buffer_scale: u32) -> u64 {
    let scale_up = if length < 256 * 1024 {
        2
    } else if length < 1024 * 1024 {
        6
    } else if length < 32 * 1024 * 1024 {
        8
    } else {
        12
    };

    binary_multiple_ceiling(length, 1u64 << (buffer_scale + scale_up))
}

/// Open the data-file channel selected by `config`.
///
/// Read-only data files always use the buffered backend.
pub fn open_channel(path: &Path, config: &StoreConfig) -> Result<Box<dyn RandomAccess>> {
    if config.read_only {
        return Ok(Box::new(ScaledFile::open(path, true, config)?));
    }

    let channel: Box<dyn RandomAccess> = match config.file_kind {
        FileKind::Buffered => Box::new(ScaledFile::open(path, false, config)?),
        FileKind::Mapped => Box::new(MappedFile::open(path, config)?),
        FileKind::Hybrid => Box::new(HybridFile::open(path, config)?),
    };

    Ok(channel)
}

/// Error returned by operations on a closed channel.
pub(crate) fn closed_error(path: &Path) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        format!("channel for {} is closed", path.display()),
    ))
}
