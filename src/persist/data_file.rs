//! Data File - one cached, crash-recoverable object file.
//!
//! # Architecture
//!
//! ```text
//!   callers (row stores)
//!        │ get / add / remove / checkpoint
//!        ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          DataFile                            │
//! │                                                              │
//! │   ObjectCache ◄── lookups without the file lock              │
//! │        │                                                     │
//! │        │ misses, inserts, write-back                         │
//! │        ▼                                                     │
//! │   Mutex<FileState>                                           │
//! │    ├── channel: Box<dyn RandomAccess>    <base>.data         │
//! │    ├── shadow:  Option<ShadowJournal>    <base>.backup       │
//! │    ├── space:   DataSpace (allocators)                       │
//! │    └── header:  FileHeader                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Thread Safety
//! The file lock serializes everything that touches the file, the
//! allocators or the cache's eviction state. It is always taken before the
//! cache's own locks. Lookups of cached objects only take the cache lock.
//!
//! # Crash recovery
//! While a file is open with incremental backup on, the pre-image of every
//! page is copied to `<base>.backup` before the page is first overwritten.
//! With incremental backup off, the whole file is copied there instead,
//! before the first change after a checkpoint. A clean close or checkpoint
//! deletes the backup. If a backup is found at open, it is restored into
//! the data file first, bringing it back to the last checkpoint.
//!
//! # Space map
//! Under the block policy a checkpoint also writes the block directory, as
//! an [`IntArrayObject`], just past the end of allocated space. The header
//! records where. A reopened file rebuilds block ownership and every free
//! list from it, so freed space is reused across sessions.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{
    storage_size_for, CacheStats, CachedObject, FactoryTable, IntArrayObject, KeepGuard,
    ObjectCache, ObjectFactory, RowInput, RowOutput, RowWriter, StatsSnapshot, SIZE_PREFIX,
};
use crate::common::config::SpacePolicy;
use crate::common::{Error, ObjectKind, Result, SpaceId, StoreConfig};
use crate::shadow::{full_copy, ShadowJournal};
use crate::space::DataSpace;
use crate::storage::{closed_error, open_channel, FileHeader, RandomAccess};

pub const DATA_SUFFIX: &str = ".data";
pub const BACKUP_SUFFIX: &str = ".backup";
pub const DEFRAG_SUFFIX: &str = ".data.new";
/// Appended to the backup path while a full copy is being written.
pub const STAGING_SUFFIX: &str = ".new";

/// `<base><suffix>`, keeping any dots already in the base name.
pub(crate) fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// How a data file is protected between checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BackupMode {
    /// Page pre-images journaled to `<base>.backup`.
    Journal,
    /// The whole file copied to `<base>.backup` before the first change.
    FullCopy,
    Off,
}

impl BackupMode {
    fn for_config(config: &StoreConfig) -> Self {
        if config.read_only {
            BackupMode::Off
        } else if config.incremental_backup {
            BackupMode::Journal
        } else if config.full_backup {
            BackupMode::FullCopy
        } else {
            BackupMode::Off
        }
    }
}

/// Everything guarded by the file lock.
pub(super) struct FileState {
    path: PathBuf,
    backup_path: PathBuf,
    pub(super) channel: Option<Box<dyn RandomAccess>>,
    pub(super) shadow: Option<ShadowJournal>,
    pub(super) space: DataSpace,
    header: FileHeader,
    backup: BackupMode,
    /// End of the saved space map, zero when the file has none.
    map_end: u64,
    /// Set once the header has been marked unsaved since the last checkpoint.
    pub(super) file_modified: bool,
    read_only: bool,
    scale: u64,
    row_padding: u32,
    row_out: RowOutput,
}

impl FileState {
    /// Open or create the data file at `data_path`.
    pub(super) fn open(
        data_path: &Path,
        backup_path: &Path,
        config: &StoreConfig,
        factories: &FactoryTable,
    ) -> Result<Self> {
        let exists = fs::metadata(data_path).map(|m| m.len() > 0).unwrap_or(false);
        let channel = open_channel(data_path, config)?;
        Self::attach(
            data_path,
            backup_path,
            channel,
            exists,
            BackupMode::for_config(config),
            config,
            factories,
        )
    }

    /// Build the state over an open channel, writing a fresh header unless
    /// the file `exists`.
    pub(super) fn attach(
        data_path: &Path,
        backup_path: &Path,
        mut channel: Box<dyn RandomAccess>,
        exists: bool,
        backup: BackupMode,
        config: &StoreConfig,
        factories: &FactoryTable,
    ) -> Result<Self> {
        let read_only = config.read_only || channel.is_read_only();
        let mut header = if exists {
            let header = FileHeader::read_from(channel.as_mut())?;
            if !header.is_saved() {
                warn!(path = %data_path.display(), "data file was not saved on last close");
            }
            header
        } else {
            if read_only {
                return Err(Error::DataFileCorrupt("read-only data file is empty".into()));
            }
            let mut header = FileHeader::default();
            header.set_saved(true);
            header.write_to(channel.as_mut())?;
            channel.sync()?;
            header
        };

        let (space, map_end) = match load_space(channel.as_mut(), &header, config, factories) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => (DataSpace::new(config, header.free_pos, header.lost_size)?, 0),
            Err(e) => {
                warn!(
                    path = %data_path.display(),
                    error = %e,
                    "space map unreadable, existing blocks go to the default space"
                );
                (DataSpace::new(config, header.free_pos, header.lost_size)?, 0)
            }
        };
        if map_end == 0 {
            header.space_map = 0;
        }

        let mut state = Self {
            path: data_path.to_path_buf(),
            backup_path: backup_path.to_path_buf(),
            channel: Some(channel),
            shadow: None,
            space,
            header,
            backup: if read_only { BackupMode::Off } else { backup },
            map_end,
            file_modified: false,
            read_only,
            scale: config.data_file_scale as u64,
            row_padding: config.row_padding(),
            row_out: RowOutput::with_capacity(1 << 12),
        };
        if exists {
            state.begin_backup(config.backup_page_size)?;
        }
        Ok(state)
    }

    fn channel(&mut self) -> Result<&mut dyn RandomAccess> {
        match self.channel.as_deref_mut() {
            Some(channel) => Ok(channel),
            None => Err(closed_error(&self.path)),
        }
    }

    pub(super) fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub(super) fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Bytes the backup must cover: allocated space plus the saved map.
    fn journal_limit(&self) -> u64 {
        self.space.free_pos().max(self.map_end)
    }

    /// Before the first write after a checkpoint: back up what is about to
    /// change and mark the header unsaved.
    fn set_file_modified(&mut self) -> Result<()> {
        if self.file_modified {
            return Ok(());
        }
        let Some(channel) = self.channel.as_deref_mut() else {
            return Err(closed_error(&self.path));
        };
        match self.backup {
            BackupMode::Journal => {
                if let Some(shadow) = self.shadow.as_mut() {
                    shadow.copy(channel, 0, FileHeader::SIZE as u64)?;
                    shadow.synch()?;
                }
            }
            BackupMode::FullCopy => {
                channel.sync()?;
                let staging = with_suffix(&self.backup_path, STAGING_SUFFIX);
                full_copy::write_full_copy(&self.path, &self.backup_path, &staging)?;
            }
            BackupMode::Off => {}
        }
        self.header.set_saved(false);
        self.header.write_to(channel)?;
        channel.sync()?;
        self.file_modified = true;
        debug!(path = %self.path.display(), "data file marked modified");
        Ok(())
    }

    /// Start backing up the next interval between checkpoints.
    pub(super) fn begin_backup(&mut self, page_size: u32) -> Result<()> {
        if self.backup == BackupMode::Journal {
            let limit = self.journal_limit();
            self.shadow = Some(ShadowJournal::new(limit, page_size, &self.backup_path)?);
        }
        self.file_modified = false;
        Ok(())
    }

    /// Delete the backup of the interval that just ended.
    pub(super) fn discard_backup(&mut self) -> Result<()> {
        if let Some(mut shadow) = self.shadow.take() {
            shadow.close()?;
            fs::remove_file(shadow.path())?;
        }
        if self.backup == BackupMode::FullCopy && self.backup_path.exists() {
            fs::remove_file(&self.backup_path)?;
        }
        Ok(())
    }

    /// Write the block directory past the end of allocated space and point
    /// the header at it. A map that is still current is left in place.
    pub(super) fn save_space_map(&mut self, factories: &FactoryTable) -> Result<()> {
        if self.header.space_map != 0 && !self.space.is_unsaved() {
            return Ok(());
        }
        let Some(map) = self.space.space_map() else {
            return Ok(());
        };
        self.header.space_map = 0;

        let object = factories.get(ObjectKind::IntArray)?.new_instance(map.len());
        let array = object
            .as_any()
            .downcast_ref::<IntArrayObject>()
            .ok_or_else(|| {
                Error::InvariantViolation("int array factory built another object type".into())
            })?;
        for (index, value) in map.into_iter().enumerate() {
            array.set(index, value)?;
        }

        let offset = self.space.free_pos();
        let size = storage_size_for(object.real_size(), self.row_padding);
        let header = object.header();
        header.set_position(offset / self.scale);
        header.set_storage_size(size);
        self.write_rows(std::slice::from_ref(&object))?;

        self.header.space_map = offset;
        self.map_end = offset + size as u64;
        debug!(path = %self.path.display(), offset, size, "space map saved");
        Ok(())
    }

    /// Record the allocator state in the header and sync.
    pub(super) fn write_header(&mut self, saved: bool) -> Result<()> {
        self.header.lost_size = self.space.lost_size_on_close();
        self.header.free_pos = self.space.free_pos();
        self.header.set_saved(saved);
        let header = self.header;
        let channel = self.channel()?;
        header.write_to(channel)?;
        channel.sync()
    }

    /// Stored size of the object at `position`, read from its prefix.
    fn read_size(&mut self, position: u64) -> Result<u32> {
        let offset = position * self.scale;
        let limit = self.space.free_pos();
        framed_size(self.channel()?, offset, limit)
    }

    /// Read the raw bytes of the object at `position`, prefix included.
    pub(super) fn read_raw(&mut self, position: u64) -> Result<Vec<u8>> {
        let offset = position * self.scale;
        let limit = self.space.free_pos();
        read_framed(self.channel()?, offset, limit)
    }

    fn read_object(
        &mut self,
        position: u64,
        factory: &dyn ObjectFactory,
    ) -> Result<Arc<dyn CachedObject>> {
        let mut input = RowInput::new(self.read_raw(position)?, position);
        let size = input.read_size_prefix()?;
        factory.read_from(&mut input, size)
    }
}

/// Size prefix of the object at byte `offset`, checked against `limit`.
fn framed_size(channel: &mut dyn RandomAccess, offset: u64, limit: u64) -> Result<u32> {
    if offset + SIZE_PREFIX as u64 > limit {
        return Err(Error::DataFileCorrupt(format!(
            "object at byte {} is past the end of allocated space",
            offset
        )));
    }
    channel.seek(offset)?;
    let size = channel.read_int()?;
    if size < SIZE_PREFIX as i32 || offset + size as u64 > limit {
        return Err(Error::DataFileCorrupt(format!(
            "object at byte {} has invalid size {}",
            offset, size
        )));
    }
    Ok(size as u32)
}

fn read_framed(channel: &mut dyn RandomAccess, offset: u64, limit: u64) -> Result<Vec<u8>> {
    let size = framed_size(channel, offset, limit)?;
    let mut bytes = vec![0u8; size as usize];
    bytes[..SIZE_PREFIX as usize].copy_from_slice(&(size as i32).to_be_bytes());
    channel.read(&mut bytes[SIZE_PREFIX as usize..])?;
    Ok(bytes)
}

/// The data space saved at the last clean close and the end of its map.
///
/// `None` when the header has no trusted map or the file appends only.
fn load_space(
    channel: &mut dyn RandomAccess,
    header: &FileHeader,
    config: &StoreConfig,
    factories: &FactoryTable,
) -> Result<Option<(DataSpace, u64)>> {
    if header.space_map == 0 || !header.is_saved() || config.space_policy != SpacePolicy::Blocks {
        return Ok(None);
    }
    let offset = header.space_map;
    let scale = config.data_file_scale as u64;
    if offset % scale != 0 {
        return Err(Error::DataFileCorrupt(format!(
            "space map at {} is not aligned to the scale",
            offset
        )));
    }

    let limit = channel.length();
    let bytes = read_framed(channel, offset, limit)?;
    let mut input = RowInput::new(bytes, offset / scale);
    let size = input.read_size_prefix()?;
    let object = factories.get(ObjectKind::IntArray)?.read_from(&mut input, size)?;
    let map = object
        .as_any()
        .downcast_ref::<IntArrayObject>()
        .ok_or_else(|| {
            Error::InvariantViolation("int array factory built another object type".into())
        })?
        .to_vec();

    let space = DataSpace::with_space_map(config, header.free_pos, header.lost_size, &map)?;
    Ok(Some((space, offset + size as u64)))
}

impl RowWriter for FileState {
    fn write_rows(&mut self, rows: &[Arc<dyn CachedObject>]) -> Result<()> {
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Ok(());
        };
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let start = placed(first.as_ref())? * self.scale;
        let end = placed(last.as_ref())? * self.scale + last.header().storage_size() as u64;

        self.row_out.reset();
        for row in rows {
            encode_row(&mut self.row_out, row.as_ref())?;
        }

        self.set_file_modified()?;
        let Some(channel) = self.channel.as_deref_mut() else {
            return Err(closed_error(&self.path));
        };
        if let Some(shadow) = self.shadow.as_mut() {
            shadow.copy(channel, start, end - start)?;
            shadow.synch()?;
        }
        if !channel.ensure_length(end)? {
            return Err(Error::FileFull {
                requested: end,
                max: channel.length(),
            });
        }
        channel.seek(start)?;
        channel.write(self.row_out.as_bytes())
    }
}

fn placed(object: &dyn CachedObject) -> Result<u64> {
    object.header().position().ok_or_else(|| {
        Error::InvariantViolation("cannot write an object without a file position".into())
    })
}

/// Append one framed object to `out`.
fn encode_row(out: &mut RowOutput, row: &dyn CachedObject) -> Result<()> {
    let size = row.header().storage_size() as usize;
    let start = out.len();
    out.write_int(size as i32);
    row.write_to(out);

    let used = out.len() - start;
    if used > size {
        return Err(Error::InvariantViolation(format!(
            "object at {:?} needs {} bytes but its slot holds {}",
            row.position(),
            used,
            size
        )));
    }
    out.pad_to(start + size);
    Ok(())
}

/// A cached object file and its allocators.
pub struct DataFile {
    pub(super) base: PathBuf,
    pub(super) data_path: PathBuf,
    pub(super) backup_path: PathBuf,
    pub(super) config: StoreConfig,
    pub(super) state: Mutex<FileState>,
    pub(super) cache: ObjectCache,
    pub(super) factories: FactoryTable,
    /// False when the caller supplied the channel.
    pub(super) owns_file: bool,
}

impl DataFile {
    /// Open `<base>.data`, creating it if missing.
    ///
    /// A leftover `<base>.backup` means the file was not closed cleanly; it
    /// is replayed before the file is opened.
    pub fn open(base: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        Self::open_with_factories(base, config, FactoryTable::with_builtins())
    }

    pub fn open_with_factories(
        base: impl AsRef<Path>,
        config: StoreConfig,
        factories: FactoryTable,
    ) -> Result<Self> {
        config.validate()?;
        let base = base.as_ref().to_path_buf();
        let data_path = with_suffix(&base, DATA_SUFFIX);
        let backup_path = with_suffix(&base, BACKUP_SUFFIX);

        if !config.read_only && backup_path.exists() {
            warn!(path = %backup_path.display(), "backup found, restoring data file");
            Self::recover(&base)?;
        }

        let state = FileState::open(&data_path, &backup_path, &config, &factories)
            .map_err(|e| e.with_file(&data_path))?;
        Ok(Self::assemble(base, data_path, backup_path, config, state, factories, true))
    }

    /// Open a data file over a channel supplied by the caller, such as a
    /// [`ReadOnlyImage`](crate::storage::ReadOnlyImage).
    ///
    /// `base` only names the file in logs and errors. No backup is kept,
    /// and a read-only channel makes the data file read-only.
    pub fn open_with_channel(
        base: impl AsRef<Path>,
        mut config: StoreConfig,
        factories: FactoryTable,
        channel: Box<dyn RandomAccess>,
    ) -> Result<Self> {
        if channel.is_read_only() {
            config.read_only = true;
        }
        config.validate()?;
        let base = base.as_ref().to_path_buf();
        let data_path = with_suffix(&base, DATA_SUFFIX);
        let backup_path = with_suffix(&base, BACKUP_SUFFIX);

        let exists = channel.length() > 0;
        let state = FileState::attach(
            &data_path,
            &backup_path,
            channel,
            exists,
            BackupMode::Off,
            &config,
            &factories,
        )
        .map_err(|e| e.with_file(&data_path))?;
        Ok(Self::assemble(base, data_path, backup_path, config, state, factories, false))
    }

    fn assemble(
        base: PathBuf,
        data_path: PathBuf,
        backup_path: PathBuf,
        config: StoreConfig,
        state: FileState,
        factories: FactoryTable,
        owns_file: bool,
    ) -> Self {
        info!(
            path = %data_path.display(),
            free_pos = state.space.free_pos(),
            lost = state.space.lost_size(),
            read_only = state.is_read_only(),
            "data file opened"
        );
        Self {
            base,
            data_path,
            backup_path,
            cache: ObjectCache::from_config(&config),
            config,
            state: Mutex::new(state),
            factories,
            owns_file,
        }
    }

    /// Restore `<base>.data` from `<base>.backup` and delete the backup.
    ///
    /// The backup is either a full copy or a shadow journal; the first
    /// bytes tell which. Does nothing if there is no backup.
    pub fn recover(base: impl AsRef<Path>) -> Result<()> {
        let base = base.as_ref();
        let data_path = with_suffix(base, DATA_SUFFIX);
        let backup_path = with_suffix(base, BACKUP_SUFFIX);

        // A staging copy never replaced the backup, so it is incomplete
        let staging = with_suffix(&backup_path, STAGING_SUFFIX);
        if staging.exists() {
            fs::remove_file(&staging)?;
        }
        if !backup_path.exists() {
            return Ok(());
        }

        let restored = if full_copy::is_full_copy(&backup_path)? {
            full_copy::restore_full_copy(&backup_path, &data_path).map(|_| ())
        } else if data_path.exists() {
            ShadowJournal::restore_file(&backup_path, &data_path)
        } else {
            Ok(())
        };
        restored.map_err(|e| e.with_file(&data_path))?;

        fs::remove_file(&backup_path)?;
        info!(path = %data_path.display(), "data file recovered from backup");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.data_path
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub(super) fn in_file<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| e.with_file(&self.data_path))
    }

    // ========================================================================
    // Public API: Objects
    // ========================================================================

    /// Place a new object in `space` and cache it as changed.
    pub fn add(&self, space: SpaceId, object: Arc<dyn CachedObject>) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let size = storage_size_for(object.real_size(), self.config.row_padding());

        let mut state = self.state.lock();
        let position = self.in_file(state.space.get_file_position(space, size, false))?;
        let header = object.header();
        header.set_position(position);
        header.set_storage_size(size);
        header.set_changed(true);

        self.in_file(self.cache.put(object, &mut *state))
    }

    /// Put an object that already has a position back into the cache.
    pub fn restore(&self, object: Arc<dyn CachedObject>) -> Result<()> {
        let mut state = self.state.lock();
        self.in_file(self.cache.put(object, &mut *state))
    }

    /// Forget the object at `position` and give its space back to `space`.
    pub fn remove(&self, space: SpaceId, position: u64) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let mut state = self.state.lock();
        let size = match self.cache.release(position) {
            Some(object) => object.header().storage_size(),
            None => self.in_file(state.read_size(position))?,
        };
        state.space.release(space, position, size);
        Ok(())
    }

    /// The object at `position`, decoded as `kind` on a cache miss.
    ///
    /// With `keep` the object is pinned; the caller unpins it with
    /// `keep_in_memory(false)` or uses [`get_kept`](Self::get_kept).
    pub fn get(&self, position: u64, kind: ObjectKind, keep: bool) -> Result<Arc<dyn CachedObject>> {
        if let Some(object) = self.cache.get_and_keep(position, keep) {
            return Ok(object);
        }

        let mut state = self.state.lock();
        // Another thread may have loaded it while we waited
        if let Some(object) = self.cache.get_and_keep(position, keep) {
            return Ok(object);
        }

        let factory = self.factories.get(kind)?;
        let object = self.in_file(state.read_object(position, factory))?;
        CacheStats::add(&self.cache.stats().rows_read, 1);
        if keep {
            object.header().keep_in_memory(true);
        }
        self.in_file(self.cache.put(Arc::clone(&object), &mut *state))?;
        Ok(object)
    }

    /// Resolve `object` to the instance currently cached for its position.
    ///
    /// Returns the same instance while it stays cached, or a freshly loaded
    /// one if it was evicted since the caller obtained it.
    pub fn get_object(
        &self,
        object: &dyn CachedObject,
        keep: bool,
    ) -> Result<Arc<dyn CachedObject>> {
        let position = placed(object)?;
        self.get(position, object.kind(), keep)
    }

    /// The object at `position`, pinned until the guard drops.
    pub fn get_kept(&self, position: u64, kind: ObjectKind) -> Result<KeepGuard> {
        Ok(KeepGuard::adopt(self.get(position, kind, true)?))
    }

    /// Write the object at `position` if changed and drop it from the cache.
    pub fn release(&self, position: u64) -> Result<()> {
        let mut state = self.state.lock();
        let Some(object) = self.cache.release(position) else {
            return Ok(());
        };
        if object.header().is_changed() {
            if let Err(e) = state.write_rows(std::slice::from_ref(&object)) {
                self.cache.put(object, &mut *state)?;
                return Err(e.with_file(&self.data_path));
            }
            object.header().set_changed(false);
        }
        Ok(())
    }

    /// Write one object now, whether or not the cache would evict it.
    pub fn save_row(&self, object: &Arc<dyn CachedObject>) -> Result<()> {
        let mut state = self.state.lock();
        self.in_file(state.write_rows(std::slice::from_ref(object)))?;
        object.header().set_changed(false);
        CacheStats::add(&self.cache.stats().rows_written, 1);
        Ok(())
    }

    /// Write every changed cached object.
    pub fn save_all(&self) -> Result<usize> {
        let mut state = self.state.lock();
        self.in_file(self.cache.save_all(&mut *state))
    }

    /// Bytes occupied by the object at `position`.
    pub fn storage_size(&self, position: u64) -> Result<u32> {
        if let Some(object) = self.cache.get(position) {
            return Ok(object.header().storage_size());
        }
        let mut state = self.state.lock();
        self.in_file(state.read_size(position))
    }

    // ========================================================================
    // Public API: File lifecycle
    // ========================================================================

    /// Write all changes, mark the file saved and start a fresh backup.
    pub fn checkpoint(&self) -> Result<()> {
        if self.config.read_only {
            return Ok(());
        }
        info!(path = %self.data_path.display(), "checkpoint started");
        let mut state = self.state.lock();
        let written = self.checkpoint_locked(&mut state)?;
        info!(path = %self.data_path.display(), written, "checkpoint finished");
        Ok(())
    }

    pub(super) fn checkpoint_locked(&self, state: &mut FileState) -> Result<usize> {
        let written = self.in_file(self.cache.save_all(&mut *state))?;
        self.in_file(state.save_space_map(&self.factories))?;
        self.in_file(state.write_header(true))?;

        self.in_file(state.discard_backup())?;
        self.in_file(state.begin_backup(self.config.backup_page_size))?;
        Ok(written)
    }

    /// Close the file. With `write`, changes are saved and the backup is
    /// deleted; without, the backup is kept so the next open rolls back to
    /// the last checkpoint.
    pub fn close(&self, write: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !state.is_open() {
            return Ok(());
        }

        if write && !self.config.read_only {
            self.in_file(self.cache.save_all(&mut *state))?;
            self.in_file(state.save_space_map(&self.factories))?;
            self.in_file(state.write_header(true))?;
        }
        self.cache.clear();

        if let Some(mut channel) = state.channel.take() {
            self.in_file(channel.close())?;
        }
        if write {
            self.in_file(state.discard_backup())?;
        } else if let Some(mut shadow) = state.shadow.take() {
            shadow.close()?;
        }

        info!(path = %self.data_path.display(), write, "data file closed");
        Ok(())
    }

    // ========================================================================
    // Public API: Space
    // ========================================================================

    pub fn new_space_id(&self) -> SpaceId {
        self.state.lock().space.new_space_id()
    }

    /// Give every block of `space` back to the file.
    pub fn free_table_space(&self, space: SpaceId) {
        self.state.lock().space.free_table_space(space);
    }

    /// Free bytes that will not be reused.
    pub fn lost_size(&self) -> u64 {
        self.state.lock().space.lost_size()
    }

    /// Whether enough space is lost that a defrag would pay off.
    pub fn should_defrag(&self) -> bool {
        self.lost_size() > self.config.defrag_limit
    }

    /// End of allocated space in bytes.
    pub fn file_free_pos(&self) -> u64 {
        self.state.lock().space.free_pos()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.cache.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DataRow, IntArrayObject};
    use crate::common::config::INITIAL_FREE_POS;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::{tempdir, TempDir};

    fn config() -> StoreConfig {
        StoreConfig::default()
            .with_data_file_scale(8)
            .with_file_block_size(4096)
    }

    fn open_test_file(config: StoreConfig) -> (DataFile, TempDir) {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path().join("test"), config).unwrap();
        (file, dir)
    }

    fn payload(object: &Arc<dyn CachedObject>) -> Vec<u8> {
        object
            .as_any()
            .downcast_ref::<DataRow>()
            .unwrap()
            .payload()
            .to_vec()
    }

    #[test]
    fn test_new_file_has_header() {
        let (file, dir) = open_test_file(config());
        assert_eq!(file.file_free_pos(), 4096);
        file.close(true).unwrap();

        let bytes = fs::read(dir.path().join("test.data")).unwrap();
        let header = FileHeader::from_bytes(bytes[..32].try_into().unwrap()).unwrap();
        assert!(header.is_saved());
        assert!(header.free_pos >= INITIAL_FREE_POS);
    }

    #[test]
    fn test_add_assigns_padded_slot() {
        let (file, _dir) = open_test_file(config());
        let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(b"hello".to_vec()));

        file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();
        assert_eq!(row.position(), Some(4));
        // 4 prefix + 4 length + 5 payload, padded to 8
        assert_eq!(row.header().storage_size(), 16);
        assert!(row.header().is_changed());
        assert!(row.header().is_in_memory());
    }

    #[test]
    fn test_round_trip_across_reopen() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("rt");
        let position = {
            let file = DataFile::open(&base, config()).unwrap();
            let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(b"persisted".to_vec()));
            file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();
            file.close(true).unwrap();
            row.position().unwrap()
        };

        let file = DataFile::open(&base, config()).unwrap();
        let row = file.get(position, ObjectKind::Row, false).unwrap();
        assert_eq!(payload(&row), b"persisted");
        assert_eq!(file.stats().rows_read, 1);
        // A reopened file journals page pre-images until the next checkpoint
        assert!(dir.path().join("rt.backup").exists());
    }

    #[test]
    fn test_get_returns_cached_instance() {
        let (file, _dir) = open_test_file(config());
        let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(b"a".to_vec()));
        file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();

        let found = file.get(row.position().unwrap(), ObjectKind::Row, false).unwrap();
        assert!(Arc::ptr_eq(&found, &row));
        assert_eq!(file.stats().rows_read, 0);
    }

    #[test]
    fn test_eviction_writes_back_and_reloads() {
        let (file, _dir) = open_test_file(config().with_max_cache_rows(4));
        let mut positions = Vec::new();
        for i in 0..20u8 {
            let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(vec![i; 10]));
            file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();
            positions.push(row.position().unwrap());
        }
        assert!(file.cache().size() <= 4);
        assert!(file.stats().evictions > 0);

        for (i, &position) in positions.iter().enumerate() {
            let row = file.get(position, ObjectKind::Row, false).unwrap();
            assert_eq!(payload(&row), vec![i as u8; 10]);
        }
    }

    #[test]
    fn test_kept_object_is_same_instance() {
        let (file, _dir) = open_test_file(config().with_max_cache_rows(2));
        let first: Arc<dyn CachedObject> = Arc::new(IntArrayObject::new(4));
        file.add(SpaceId::DEFAULT, Arc::clone(&first)).unwrap();
        let position = first.position().unwrap();

        let guard = file.get_kept(position, ObjectKind::IntArray).unwrap();
        for _ in 0..10 {
            let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(vec![0; 8]));
            file.add(SpaceId::DEFAULT, row).unwrap();
        }

        let again = file.get(position, ObjectKind::IntArray, false).unwrap();
        assert!(Arc::ptr_eq(&again, &first));
        assert!(std::ptr::eq(guard.header(), first.header()));
        drop(guard);
        assert!(!first.header().is_kept());
    }

    #[test]
    fn test_remove_returns_space() {
        let (file, _dir) = open_test_file(config());
        let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(vec![1; 20]));
        file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();
        let position = row.position().unwrap();

        file.remove(SpaceId::DEFAULT, position).unwrap();
        assert!(!file.cache().contains(position));

        let next: Arc<dyn CachedObject> = Arc::new(DataRow::new(vec![2; 20]));
        file.add(SpaceId::DEFAULT, Arc::clone(&next)).unwrap();
        assert_eq!(next.position(), Some(position));
    }

    #[test]
    fn test_release_writes_changed_object() {
        let (file, _dir) = open_test_file(config());
        let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(b"released".to_vec()));
        file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();
        let position = row.position().unwrap();

        file.release(position).unwrap();
        assert!(!row.header().is_changed());
        assert!(!file.cache().contains(position));

        let reloaded = file.get(position, ObjectKind::Row, false).unwrap();
        assert!(!Arc::ptr_eq(&reloaded, &row));
        assert_eq!(payload(&reloaded), b"released");
        assert_eq!(file.storage_size(position).unwrap(), 16);
    }

    #[test]
    fn test_unknown_kind_on_miss() {
        let (file, _dir) = open_test_file(config());
        let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(b"x".to_vec()));
        file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();
        let position = row.position().unwrap();
        file.release(position).unwrap();

        let err = file.get(position, ObjectKind::Custom(3), false).err().unwrap();
        assert!(matches!(err, Error::UnknownObjectKind(3)));
    }

    /// Object whose encoded size can grow after placement.
    struct Growing {
        header: crate::cache::ObjectHeader,
        len: AtomicU32,
    }

    impl CachedObject for Growing {
        fn header(&self) -> &crate::cache::ObjectHeader {
            &self.header
        }
        fn kind(&self) -> ObjectKind {
            ObjectKind::Custom(1)
        }
        fn real_size(&self) -> u32 {
            self.len.load(Ordering::Relaxed)
        }
        fn write_to(&self, out: &mut RowOutput) {
            out.write_bytes(&vec![0xAB; self.real_size() as usize]);
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn test_oversized_object_is_invariant_violation() {
        let (file, _dir) = open_test_file(config());
        let object = Arc::new(Growing {
            header: crate::cache::ObjectHeader::new(),
            len: AtomicU32::new(4),
        });
        let shared: Arc<dyn CachedObject> = object.clone();
        file.add(SpaceId::DEFAULT, Arc::clone(&shared)).unwrap();

        object.len.store(100, Ordering::Relaxed);
        let err = file.save_row(&shared).unwrap_err();
        assert!(matches!(err.root(), Error::InvariantViolation(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_closed_file_rejects_io() {
        let (file, _dir) = open_test_file(config());
        let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(b"x".to_vec()));
        file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();
        let position = row.position().unwrap();
        file.close(true).unwrap();

        assert!(file.get(position, ObjectKind::Row, false).is_err());
        // Closing twice is harmless
        file.close(true).unwrap();
    }

    #[test]
    fn test_read_only_rejects_changes() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("ro");
        let position = {
            let file = DataFile::open(&base, config()).unwrap();
            let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(b"fixed".to_vec()));
            file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();
            file.close(true).unwrap();
            row.position().unwrap()
        };

        let file = DataFile::open(&base, config().with_read_only(true)).unwrap();
        assert_eq!(payload(&file.get(position, ObjectKind::Row, false).unwrap()), b"fixed");
        let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(b"new".to_vec()));
        assert!(matches!(file.add(SpaceId::DEFAULT, row), Err(Error::ReadOnly)));
        assert!(matches!(file.remove(SpaceId::DEFAULT, position), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_should_defrag_follows_lost_size() {
        let (file, _dir) = open_test_file(config().with_defrag_limit(16));
        assert!(!file.should_defrag());

        let space = file.new_space_id();
        let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(vec![0; 8]));
        file.add(space, row).unwrap();
        file.free_table_space(space);
        assert!(file.lost_size() > 16);
        assert!(file.should_defrag());
    }
}
