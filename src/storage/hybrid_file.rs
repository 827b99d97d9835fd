//! Mapped channel that falls back to buffered I/O past a size threshold.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::common::config::StoreConfig;
use crate::common::Result;

use super::channel::RandomAccess;
use super::mapped_file::MappedFile;
use super::scaled_file::ScaledFile;

enum Backend {
    Mapped(MappedFile),
    Buffered(ScaledFile),
}

impl Backend {
    fn channel(&self) -> &dyn RandomAccess {
        match self {
            Backend::Mapped(file) => file,
            Backend::Buffered(file) => file,
        }
    }

    fn channel_mut(&mut self) -> &mut dyn RandomAccess {
        match self {
            Backend::Mapped(file) => file,
            Backend::Buffered(file) => file,
        }
    }
}

/// A data file that is memory mapped while small and buffered once large.
///
/// The switch is one-way. When a requested length crosses the map limit the
/// mapped backend is synced and closed, a [`ScaledFile`] is opened on the
/// same path and the position is restored on it.
pub struct HybridFile {
    path: PathBuf,
    config: StoreConfig,
    backend: Backend,
}

impl HybridFile {
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let existing = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        let backend = if existing > config.mapped_size_limit {
            Backend::Buffered(ScaledFile::open(path, false, config)?)
        } else {
            Backend::Mapped(MappedFile::open(path, config)?)
        };

        Ok(Self {
            path: path.to_path_buf(),
            config: config.clone(),
            backend,
        })
    }

    fn switch_to_buffered(&mut self) -> Result<()> {
        let position = self.backend.channel().position();
        {
            let current = self.backend.channel_mut();
            current.sync()?;
            current.close()?;
        }

        let mut file = ScaledFile::open(&self.path, false, &self.config)?;
        file.seek(position)?;
        self.backend = Backend::Buffered(file);

        info!(
            path = %self.path.display(),
            limit = self.config.mapped_size_limit,
            "switched data file from mapped to buffered access"
        );
        Ok(())
    }
}

impl RandomAccess for HybridFile {
    fn length(&self) -> u64 {
        self.backend.channel().length()
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.backend.channel_mut().seek(position)
    }

    fn position(&self) -> u64 {
        self.backend.channel().position()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.backend.channel_mut().read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let end = self.position() + buf.len() as u64;
        self.ensure_length(end)?;
        self.backend.channel_mut().write(buf)
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        if matches!(self.backend, Backend::Mapped(_)) && length > self.config.mapped_size_limit {
            self.switch_to_buffered()?;
        }
        self.backend.channel_mut().set_length(length)
    }

    fn ensure_length(&mut self, length: u64) -> Result<bool> {
        if self.backend.channel_mut().ensure_length(length)? {
            return Ok(true);
        }
        if !matches!(self.backend, Backend::Mapped(_)) {
            return Ok(false);
        }
        self.switch_to_buffered()?;
        self.backend.channel_mut().ensure_length(length)
    }

    fn sync(&mut self) -> Result<()> {
        self.backend.channel_mut().sync()
    }

    fn close(&mut self) -> Result<()> {
        self.backend.channel_mut().close()
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn is_mapped(&self) -> bool {
        self.backend.channel().is_mapped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::FileKind;
    use tempfile::tempdir;

    fn small_config() -> StoreConfig {
        StoreConfig::default()
            .with_file_kind(FileKind::Hybrid)
            .with_mapped_size_limit(32 * 1024)
    }

    #[test]
    fn test_starts_mapped() {
        let dir = tempdir().unwrap();
        let file = HybridFile::open(dir.path().join("h.data"), &small_config()).unwrap();
        assert!(file.is_mapped());
    }

    #[test]
    fn test_switches_past_limit_and_keeps_data() {
        let dir = tempdir().unwrap();
        let mut file = HybridFile::open(dir.path().join("h.data"), &small_config()).unwrap();

        file.seek(100).unwrap();
        file.write_long(0x0102_0304_0506_0708).unwrap();
        assert!(file.is_mapped());

        file.seek(40 * 1024).unwrap();
        file.write_int(99).unwrap();
        assert!(!file.is_mapped());
        assert!(file.length() >= 40 * 1024 + 4);

        file.seek(100).unwrap();
        assert_eq!(file.read_long().unwrap(), 0x0102_0304_0506_0708);
        file.seek(40 * 1024).unwrap();
        assert_eq!(file.read_int().unwrap(), 99);
    }

    #[test]
    fn test_reopen_large_file_is_buffered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.data");
        {
            let mut file = HybridFile::open(&path, &small_config()).unwrap();
            file.set_length(64 * 1024).unwrap();
            file.close().unwrap();
        }

        let file = HybridFile::open(&path, &small_config()).unwrap();
        assert!(!file.is_mapped());
        assert_eq!(file.length(), 64 * 1024);
    }

    #[test]
    fn test_ensure_length_switches_only_once() {
        let dir = tempdir().unwrap();
        let mut file = HybridFile::open(dir.path().join("h.data"), &small_config()).unwrap();

        file.seek(200).unwrap();
        assert!(file.ensure_length(48 * 1024).unwrap());
        assert!(!file.is_mapped());
        assert_eq!(file.position(), 200);

        // Already buffered: growth goes straight to the buffered backend
        assert!(file.ensure_length(96 * 1024).unwrap());
        assert!(!file.is_mapped());
        assert_eq!(file.position(), 200);
        assert!(file.length() >= 96 * 1024);
    }
}
