//! Configuration for a data file and everything built on it.
//!
//! Every component receives a [`StoreConfig`] at construction. There is no
//! ambient global state: two data files in one process may use different
//! scales, cache budgets or channel kinds.

use crate::common::{Error, Result};

/// Offset of the first object in a data file. Bytes below it hold the header.
pub const INITIAL_FREE_POS: u64 = 32;

/// Alignment unit for block-aligned allocations (whole-table moves).
pub const FIXED_BLOCK_SIZE_UNIT: u64 = 4096;

/// Default multiplier between stored positions and byte offsets.
pub const DEFAULT_DATA_FILE_SCALE: u32 = 64;

/// Smallest padding unit for a stored object.
pub const MIN_ROW_PADDING: u32 = 8;

/// Default page size of the incremental backup journal (16KB).
pub const DEFAULT_BACKUP_PAGE_SIZE: u32 = 1 << 14;

/// Which [`RandomAccess`](crate::storage::RandomAccess) backend a data file uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Buffered positional I/O over a regular file.
    #[default]
    Buffered,
    /// Memory-mapped file, limited to `mapped_size_limit` bytes.
    Mapped,
    /// Memory-mapped until `mapped_size_limit`, buffered file afterwards.
    Hybrid,
}

/// How file space is handed out to tables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SpacePolicy {
    /// Always append at the end of the file; freed space is never reused.
    Append,
    /// Per-table free lists carved from directory-managed file blocks.
    #[default]
    Blocks,
}

/// Tunables for one data file.
///
/// # Example
/// ```
/// use cachestore::common::config::{FileKind, StoreConfig};
///
/// let config = StoreConfig::default()
///     .with_data_file_scale(8)
///     .with_max_cache_rows(1000)
///     .with_file_kind(FileKind::Hybrid);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.row_padding(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum number of objects held by the object cache.
    pub max_cache_rows: usize,
    /// Maximum total storage size of the objects held by the cache.
    pub max_cache_bytes: u64,
    /// Multiplier converting a stored position into a byte offset.
    pub data_file_scale: u32,
    /// Size of the file blocks the space directory hands to tables.
    pub file_block_size: u64,
    /// Maximum number of free ranges tracked per table space.
    pub free_list_capacity: usize,
    /// Largest byte length the data file may reach.
    pub max_data_file_size: u64,
    /// Channel backend.
    pub file_kind: FileKind,
    /// Read buffer size is `1 << buffer_scale` bytes.
    pub buffer_scale: u32,
    /// Mapped backends never grow past this many bytes.
    pub mapped_size_limit: u64,
    /// Grow files geometrically instead of to the exact length requested.
    pub extend_length: bool,
    /// Keep a shadow journal of pre-images between checkpoints.
    pub incremental_backup: bool,
    /// Without incremental backup, copy the whole data file before the
    /// first change after each checkpoint.
    pub full_backup: bool,
    /// Page size of the shadow journal.
    pub backup_page_size: u32,
    /// Allocation policy for table spaces.
    pub space_policy: SpacePolicy,
    /// Open the data file read-only.
    pub read_only: bool,
    /// Lost bytes above which [`should_defrag`](crate::persist::DataFile::should_defrag) is true.
    pub defrag_limit: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let max_cache_rows = 3 << 14;
        Self {
            max_cache_rows,
            max_cache_bytes: (max_cache_rows as u64) << 10,
            data_file_scale: DEFAULT_DATA_FILE_SCALE,
            file_block_size: FIXED_BLOCK_SIZE_UNIT * DEFAULT_DATA_FILE_SCALE as u64,
            free_list_capacity: 512,
            max_data_file_size: i32::MAX as u64 * DEFAULT_DATA_FILE_SCALE as u64,
            file_kind: FileKind::Buffered,
            buffer_scale: 12,
            mapped_size_limit: 1 << 28,
            extend_length: true,
            incremental_backup: true,
            full_backup: true,
            backup_page_size: DEFAULT_BACKUP_PAGE_SIZE,
            space_policy: SpacePolicy::Blocks,
            read_only: false,
            defrag_limit: 200 << 20,
        }
    }
}

impl StoreConfig {
    /// Profile for session and result stores: append-only, no backup.
    pub fn temporary() -> Self {
        Self {
            incremental_backup: false,
            full_backup: false,
            space_policy: SpacePolicy::Append,
            ..Self::default()
        }
    }

    pub fn with_max_cache_rows(mut self, rows: usize) -> Self {
        self.max_cache_rows = rows;
        self
    }

    pub fn with_max_cache_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    /// Set the scale. The maximum file size follows it.
    pub fn with_data_file_scale(mut self, scale: u32) -> Self {
        self.data_file_scale = scale;
        self.max_data_file_size = i32::MAX as u64 * scale as u64;
        self
    }

    pub fn with_file_block_size(mut self, size: u64) -> Self {
        self.file_block_size = size;
        self
    }

    pub fn with_free_list_capacity(mut self, capacity: usize) -> Self {
        self.free_list_capacity = capacity;
        self
    }

    pub fn with_max_data_file_size(mut self, size: u64) -> Self {
        self.max_data_file_size = size;
        self
    }

    pub fn with_file_kind(mut self, kind: FileKind) -> Self {
        self.file_kind = kind;
        self
    }

    pub fn with_mapped_size_limit(mut self, limit: u64) -> Self {
        self.mapped_size_limit = limit;
        self
    }

    pub fn with_extend_length(mut self, extend: bool) -> Self {
        self.extend_length = extend;
        self
    }

    pub fn with_incremental_backup(mut self, enabled: bool) -> Self {
        self.incremental_backup = enabled;
        self
    }

    pub fn with_full_backup(mut self, enabled: bool) -> Self {
        self.full_backup = enabled;
        self
    }

    pub fn with_backup_page_size(mut self, size: u32) -> Self {
        self.backup_page_size = size;
        self
    }

    pub fn with_space_policy(mut self, policy: SpacePolicy) -> Self {
        self.space_policy = policy;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_defrag_limit(mut self, limit: u64) -> Self {
        self.defrag_limit = limit;
        self
    }

    /// Stored sizes are rounded up to a multiple of this.
    #[inline]
    pub fn row_padding(&self) -> u32 {
        self.data_file_scale.max(MIN_ROW_PADDING)
    }

    /// Size of the channel read buffer in bytes.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        1 << self.buffer_scale
    }

    /// Check that the values are mutually consistent.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let scale = self.data_file_scale;
        if !scale.is_power_of_two() || scale > 1024 {
            return Err(Error::InvalidConfig(format!(
                "data_file_scale {} must be a power of two in 1..=1024",
                scale
            )));
        }
        if self.max_cache_rows == 0 || self.max_cache_bytes == 0 {
            return Err(Error::InvalidConfig(
                "cache limits must be greater than zero".into(),
            ));
        }
        if self.file_block_size == 0 || self.file_block_size % FIXED_BLOCK_SIZE_UNIT != 0 {
            return Err(Error::InvalidConfig(format!(
                "file_block_size {} must be a non-zero multiple of {}",
                self.file_block_size, FIXED_BLOCK_SIZE_UNIT
            )));
        }
        if self.file_block_size % scale as u64 != 0 {
            return Err(Error::InvalidConfig(format!(
                "file_block_size {} is not a multiple of the scale {}",
                self.file_block_size, scale
            )));
        }
        if !(8..=13).contains(&self.buffer_scale) {
            return Err(Error::InvalidConfig(format!(
                "buffer_scale {} must be in 8..=13",
                self.buffer_scale
            )));
        }
        if !self.backup_page_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "backup_page_size {} must be a power of two",
                self.backup_page_size
            )));
        }
        if self.max_data_file_size <= INITIAL_FREE_POS {
            return Err(Error::InvalidConfig(
                "max_data_file_size leaves no room for data".into(),
            ));
        }
        Ok(())
    }
}
