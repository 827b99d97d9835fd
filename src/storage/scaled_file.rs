//! Buffered positional file I/O.
//!
//! [`ScaledFile`] is the default data-file channel:
//! - One power-of-two read buffer, aligned to its own size
//! - Direct reads for requests larger than the buffer
//! - Geometric file growth via [`extended_length`]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::common::config::StoreConfig;
use crate::common::{Error, Result};

use super::channel::{closed_error, extended_length, RandomAccess};

/// A regular file accessed through a read buffer.
///
/// # Buffer
/// ```text
/// file:   |........|........|XXXXXXXX|........|
///                           ^ buffer_offset (multiple of buffer size)
/// buffer:                   |XXXXXXXX| buffer_len valid bytes
/// ```
/// Reads that fall inside one aligned buffer window fill the buffer once and
/// are served from memory afterwards. Writes go straight to the file and
/// invalidate an overlapping buffer.
///
/// # Thread Safety
/// `ScaledFile` is **single-threaded**. The data file's writer lock
/// serializes access to it.
pub struct ScaledFile {
    path: PathBuf,
    file: Option<File>,
    read_only: bool,
    extend_length: bool,
    buffer_scale: u32,
    buffer: Vec<u8>,
    buffer_offset: u64,
    /// Valid bytes in `buffer`; 0 when the buffer is invalid.
    buffer_len: usize,
    file_length: u64,
    position: u64,
}

impl ScaledFile {
    /// Open `path`, creating it when writable and missing.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, or if a read-only
    /// open targets a missing file.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = if read_only {
            OpenOptions::new().read(true).open(path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?
        };
        let file_length = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            read_only,
            extend_length: config.extend_length,
            buffer_scale: config.buffer_scale,
            buffer: vec![0u8; config.buffer_size()],
            buffer_offset: 0,
            buffer_len: 0,
            file_length,
            position: 0,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Invalidate the read buffer and re-read the file length.
    ///
    /// Called after any I/O failure so that no stale bytes are served.
    pub fn reset_pointer(&mut self) {
        self.buffer_len = 0;
        self.buffer_offset = 0;
        if let Some(file) = &self.file {
            if let Ok(meta) = file.metadata() {
                self.file_length = meta.len();
            }
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(closed_error(&self.path)),
        }
    }

    /// Log, reset, and hand back an I/O failure.
    fn fail<T>(&mut self, op: &str, position: u64, len: usize, err: Error) -> Result<T> {
        error!(
            path = %self.path.display(),
            position,
            len,
            "{} failed: {}",
            op,
            err
        );
        self.reset_pointer();
        Err(err)
    }

    fn buffer_covers(&self, position: u64, len: usize) -> bool {
        self.buffer_len > 0
            && position >= self.buffer_offset
            && position + len as u64 <= self.buffer_offset + self.buffer_len as u64
    }

    fn read_direct(&mut self, position: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn fill_buffer(&mut self, aligned: u64) -> Result<()> {
        let available = (self.file_length - aligned).min(self.buffer.len() as u64) as usize;
        self.buffer_len = 0;

        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Err(closed_error(&self.path)),
        };
        file.seek(SeekFrom::Start(aligned))?;
        file.read_exact(&mut self.buffer[..available])?;

        self.buffer_offset = aligned;
        self.buffer_len = available;
        Ok(())
    }

    fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<()> {
        if position + buf.len() as u64 > self.file_length {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {} bytes at {} past end of file ({} bytes)",
                    buf.len(),
                    position,
                    self.file_length
                ),
            )));
        }

        if !self.buffer_covers(position, buf.len()) {
            let mask = self.buffer.len() as u64 - 1;
            let aligned = position & !mask;
            let fits = position + buf.len() as u64 <= aligned + self.buffer.len() as u64;

            if !fits {
                return self.read_direct(position, buf);
            }
            self.fill_buffer(aligned)?;
        }

        let start = (position - self.buffer_offset) as usize;
        buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, position: u64, buf: &[u8]) -> Result<()> {
        let end = position + buf.len() as u64;
        if end > self.file_length {
            self.grow_to(end)?;
        }

        let file = self.file()?;
        file.seek(SeekFrom::Start(position))?;
        file.write_all(buf)?;

        // Overlapping buffer contents are now stale.
        if self.buffer_len > 0
            && position < self.buffer_offset + self.buffer_len as u64
            && end > self.buffer_offset
        {
            self.buffer_len = 0;
        }
        Ok(())
    }

    fn grow_to(&mut self, length: u64) -> Result<()> {
        let new_length = if self.extend_length {
            extended_length(length, self.buffer_scale)
        } else {
            length
        };

        // set_len zero-fills the new region
        self.file()?.set_len(new_length)?;
        self.file_length = new_length;
        Ok(())
    }
}

impl RandomAccess for ScaledFile {
    #[inline]
    fn length(&self) -> u64 {
        self.file_length
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
        let position = self.position;
        match self.read_at(position, buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(e) => self.fail("read", position, buf.len(), e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let position = self.position;
        match self.write_at(position, buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(e) => self.fail("write", position, buf.len(), e),
        }
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let result = self.file().and_then(|f| f.set_len(length).map_err(Error::from));
        match result {
            Ok(()) => {
                self.file_length = length;
                self.buffer_len = 0;
                Ok(())
            }
            Err(e) => self.fail("set_length", length, 0, e),
        }
    }

    fn ensure_length(&mut self, length: u64) -> Result<bool> {
        if length <= self.file_length {
            return Ok(true);
        }
        if self.read_only {
            return Ok(false);
        }

        match self.grow_to(length) {
            Ok(()) => Ok(true),
            Err(e) => self.fail("ensure_length", length, 0, e),
        }
    }

    fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }

        let result = self.file().and_then(|f| f.sync_all().map_err(Error::from));
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail("sync", self.position, 0, e),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.file.is_some() && !self.read_only {
            self.sync()?;
        }
        self.file = None;
        self.buffer_len = 0;
        Ok(())
    }

    #[inline]
    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
