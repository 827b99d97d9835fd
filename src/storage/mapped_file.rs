//! Memory-mapped data-file channel.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, error};

use crate::common::config::StoreConfig;
use crate::common::{Error, Result};

use super::channel::{closed_error, extended_length, RandomAccess};

/// A file accessed through a writable memory map.
///
/// The map always covers the whole file. Growing the file flushes the
/// current map, extends the file (zero-filled) and maps it again; the
/// `&mut self` receiver guarantees no slice of the old map survives.
///
/// The map never grows past `limit` bytes: `ensure_length` returns `false`
/// instead, which is the signal [`HybridFile`](super::HybridFile) uses to
/// switch to buffered I/O.
pub struct MappedFile {
    path: PathBuf,
    file: Option<File>,
    /// `None` while the file is empty; zero-length maps are not portable.
    mmap: Option<MmapMut>,
    length: u64,
    position: u64,
    limit: u64,
    extend_length: bool,
    buffer_scale: u32,
}

impl MappedFile {
    /// Open or create `path` and map it.
    ///
    /// # Errors
    /// Fails if the file is already longer than the configured map limit.
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let length = file.metadata()?.len();

        if length > config.mapped_size_limit {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "{} is {} bytes, larger than the mapped limit {}",
                    path.display(),
                    length,
                    config.mapped_size_limit
                ),
            )));
        }

        let mmap = Self::map(&file, length)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            mmap,
            length,
            position: 0,
            limit: config.mapped_size_limit,
            extend_length: config.extend_length,
            buffer_scale: config.buffer_scale,
        })
    }

    fn map(file: &File, length: u64) -> Result<Option<MmapMut>> {
        if length == 0 {
            return Ok(None);
        }

        // SAFETY: MmapMut::map_mut is unsafe because the file could be
        // changed by another process while mapped. The data file is owned
        // exclusively by this channel, and every remap happens under
        // `&mut self`, so no slice into an old mapping can outlive it.
        let mmap = unsafe { MmapMut::map_mut(file)? };
        Ok(Some(mmap))
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Largest length this channel can be grown to.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn fail<T>(&self, op: &str, position: u64, len: usize, err: Error) -> Result<T> {
        error!(
            path = %self.path.display(),
            position,
            len,
            "{} failed: {}",
            op,
            err
        );
        Err(err)
    }

    fn remap(&mut self, new_length: u64) -> Result<()> {
        if let Some(mmap) = &self.mmap {
            mmap.flush()?;
        }
        self.mmap = None;

        let file = match self.file.as_ref() {
            Some(file) => file,
            None => return Err(closed_error(&self.path)),
        };
        file.set_len(new_length)?;
        self.mmap = Self::map(file, new_length)?;
        self.length = new_length;

        debug!(path = %self.path.display(), new_length, "remapped data file");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(closed_error(&self.path));
        }
        Ok(())
    }

    fn out_of_range(&self, position: u64, len: usize) -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "access of {} bytes at {} outside mapped length {}",
                len, position, self.length
            ),
        ))
    }
}

impl RandomAccess for MappedFile {
    #[inline]
    fn length(&self) -> u64 {
        self.length
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    #[inline]
    fn position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;
        let start = self.position;
        let end = start + buf.len() as u64;
        if end > self.length {
            let err = self.out_of_range(start, buf.len());
            return self.fail("read", start, buf.len(), err);
        }

        if let Some(mmap) = &self.mmap {
            buf.copy_from_slice(&mmap[start as usize..end as usize]);
        }
        self.position = end;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        let start = self.position;
        let end = start + buf.len() as u64;

        if end > self.length && !self.ensure_length(end)? {
            let err = self.out_of_range(start, buf.len());
            return self.fail("write", start, buf.len(), err);
        }

        if let Some(mmap) = self.mmap.as_mut() {
            mmap[start as usize..end as usize].copy_from_slice(buf);
        }
        self.position = end;
        Ok(())
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        if length > self.limit {
            let err = self.out_of_range(length, 0);
            return self.fail("set_length", length, 0, err);
        }
        match self.remap(length) {
            Ok(()) => Ok(()),
            Err(e) => self.fail("set_length", length, 0, e),
        }
    }

    fn ensure_length(&mut self, length: u64) -> Result<bool> {
        if length <= self.length {
            return Ok(true);
        }
        if length > self.limit {
            return Ok(false);
        }

        let target = if self.extend_length {
            extended_length(length, self.buffer_scale).min(self.limit)
        } else {
            length
        };

        match self.remap(target) {
            Ok(()) => Ok(true),
            Err(e) => self.fail("ensure_length", length, 0, e),
        }
    }

    fn sync(&mut self) -> Result<()> {
        let result = match (&self.mmap, &self.file) {
            (Some(mmap), Some(file)) => mmap
                .flush()
                .and_then(|()| file.sync_all())
                .map_err(Error::from),
            (None, Some(file)) => file.sync_all().map_err(Error::from),
            (_, None) => Err(closed_error(&self.path)),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail("sync", self.position, 0, e),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.file.is_some() {
            self.sync()?;
        }
        self.mmap = None;
        self.file = None;
        Ok(())
    }

    #[inline]
    fn is_read_only(&self) -> bool {
        false
    }

    #[inline]
    fn is_mapped(&self) -> bool {
        true
    }
}
