//! Incremental backup: pre-images of pages touched since the last checkpoint.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::common::{Error, Result};
use crate::storage::RandomAccess;

use super::bitmap::PageBitmap;

/// Bytes before each page image: `[i32 page size][i64 position]`.
const RECORD_HEADER_SIZE: usize = 12;

/// Append-only journal of page pre-images.
///
/// # Record format
/// ```text
/// [i32 page_size][i64 position][page_size bytes]
/// ```
/// Records are written in capture order and page 0 is always the first one.
/// A page whose source ends early is zero-padded to the full page size.
///
/// The journal only covers the first `max_size` bytes of the source, which
/// is the allocated length of the data file when the journal started. Space
/// appended after that point has no pre-image worth keeping.
pub struct ShadowJournal {
    path: PathBuf,
    max_size: u64,
    page_size: u32,
    bitmap: PageBitmap,
    dest: Option<File>,
    saved_length: u64,
    page_buffer: Vec<u8>,
}

impl ShadowJournal {
    /// Start a new journal at `path`, discarding any previous content.
    pub fn new<P: AsRef<Path>>(max_size: u64, page_size: u32, path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let dest = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        debug!(path = %path.display(), max_size, page_size, "shadow journal started");

        Ok(Self {
            path,
            max_size,
            page_size,
            bitmap: PageBitmap::new(max_size, page_size),
            dest: Some(dest),
            saved_length: 0,
            page_buffer: vec![0u8; page_size as usize],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Bytes of complete records written so far.
    pub fn saved_length(&self) -> u64 {
        self.saved_length
    }

    /// Number of distinct pages captured.
    pub fn saved_pages(&self) -> usize {
        self.bitmap.count_set()
    }

    pub fn is_page_saved(&self, page: usize) -> bool {
        self.bitmap.is_set(page)
    }

    /// Capture every page of `source` overlapping `[offset, offset + size)`
    /// that has not been captured yet. Page 0 always goes first.
    ///
    /// # Errors
    /// On failure the page being copied is left unmarked, the journal is
    /// truncated to its last complete record and closed.
    pub fn copy(&mut self, source: &mut dyn RandomAccess, offset: u64, size: u64) -> Result<()> {
        if !self.bitmap.is_set(0) && !self.bitmap.is_empty() {
            self.copy_page(source, 0)?;
        }

        if size == 0 || offset >= self.max_size {
            return Ok(());
        }

        let end = (offset + size).min(self.max_size);
        let page_size = self.page_size as u64;
        let first = offset / page_size;
        let last = (end - 1) / page_size;

        for page in first..=last {
            self.copy_page(source, page as usize)?;
        }
        Ok(())
    }

    fn copy_page(&mut self, source: &mut dyn RandomAccess, page: usize) -> Result<()> {
        if self.bitmap.set(page) {
            return Ok(());
        }

        match self.write_page(source, page) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    page,
                    saved_length = self.saved_length,
                    "shadow page copy failed: {}",
                    e
                );
                self.bitmap.unset(page);
                if let Some(dest) = self.dest.take() {
                    if let Err(truncate_err) = dest.set_len(self.saved_length) {
                        warn!(
                            path = %self.path.display(),
                            "could not truncate shadow journal: {}",
                            truncate_err
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn write_page(&mut self, source: &mut dyn RandomAccess, page: usize) -> Result<()> {
        let position = page as u64 * self.page_size as u64;
        let available = source.length().saturating_sub(position);
        let read_len = available.min(self.page_size as u64) as usize;

        self.page_buffer.fill(0);
        if read_len > 0 {
            source.seek(position)?;
            source.read(&mut self.page_buffer[..read_len])?;
        }

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + self.page_buffer.len());
        record.extend_from_slice(&(self.page_size as i32).to_be_bytes());
        record.extend_from_slice(&(position as i64).to_be_bytes());
        record.extend_from_slice(&self.page_buffer);

        let saved_length = self.saved_length;
        let dest = self.open_dest()?;
        dest.seek(SeekFrom::Start(saved_length))?;
        dest.write_all(&record)?;

        self.saved_length += record.len() as u64;
        Ok(())
    }

    fn open_dest(&mut self) -> Result<&mut File> {
        if self.dest.is_none() {
            let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            self.dest = Some(file);
        }
        match self.dest.as_mut() {
            Some(dest) => Ok(dest),
            None => Err(Error::InvariantViolation("shadow journal not open".into())),
        }
    }

    /// Force captured pages to disk. Must complete before the pages they
    /// protect are overwritten.
    pub fn synch(&mut self) -> Result<()> {
        if let Some(dest) = self.dest.as_mut() {
            dest.flush()?;
            dest.sync_all()?;
        }
        Ok(())
    }

    /// Sync and release the file handle. The next copy reopens it.
    pub fn close(&mut self) -> Result<()> {
        self.synch()?;
        self.dest = None;
        Ok(())
    }

    /// A reader over the complete records, for an external backup writer.
    pub fn reader(&self) -> Result<Take<File>> {
        let file = File::open(&self.path)?;
        Ok(file.take(self.saved_length))
    }

    /// Replay every record of `backup` into `target`, then sync `target`.
    ///
    /// A trailing record cut short by a crash is ignored: its page was
    /// never overwritten, because pages are written only after the journal
    /// is synced.
    pub fn restore_file<P: AsRef<Path>, Q: AsRef<Path>>(backup: P, target: Q) -> Result<()> {
        let backup = backup.as_ref();
        let target = target.as_ref();

        let mut reader = BufReader::new(File::open(backup)?);
        let mut dest = OpenOptions::new().write(true).open(target)?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let mut page = Vec::new();
        let mut records = 0usize;

        loop {
            if !read_full(&mut reader, &mut header)? {
                break;
            }

            let size = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let mut pos_bytes = [0u8; 8];
            pos_bytes.copy_from_slice(&header[4..12]);
            let position = i64::from_be_bytes(pos_bytes);

            if size <= 0 || position < 0 {
                return Err(Error::DataFileCorrupt(format!(
                    "{}: bad shadow record {} (size {}, position {})",
                    backup.display(),
                    records,
                    size,
                    position
                )));
            }

            page.resize(size as usize, 0);
            if !read_full(&mut reader, &mut page)? {
                warn!(
                    backup = %backup.display(),
                    records,
                    "ignoring incomplete trailing shadow record"
                );
                break;
            }

            dest.seek(SeekFrom::Start(position as u64))?;
            dest.write_all(&page)?;
            records += 1;
        }

        dest.sync_all()?;
        info!(
            backup = %backup.display(),
            target = %target.display(),
            records,
            "restored data file from shadow journal"
        );
        Ok(())
    }
}

/// Fill `buf` completely. Returns `false` if the stream ends first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::StoreConfig;
    use crate::storage::ScaledFile;
    use tempfile::tempdir;

    fn source_with(path: &Path, bytes: &[u8]) -> ScaledFile {
        let config = StoreConfig::default().with_extend_length(false);
        let mut file = ScaledFile::open(path, false, &config).unwrap();
        file.write(bytes).unwrap();
        file.sync().unwrap();
        file
    }

    #[test]
    fn test_copy_is_idempotent_per_page() {
        let dir = tempdir().unwrap();
        let mut source = source_with(&dir.path().join("s.data"), &[7u8; 1024]);
        let mut journal = ShadowJournal::new(1024, 256, dir.path().join("s.backup")).unwrap();

        journal.copy(&mut source, 0, 100).unwrap();
        journal.copy(&mut source, 50, 60).unwrap();

        assert_eq!(journal.saved_pages(), 1);
        assert_eq!(journal.saved_length(), (RECORD_HEADER_SIZE + 256) as u64);
    }

    #[test]
    fn test_page_zero_captured_first() {
        let dir = tempdir().unwrap();
        let mut source = source_with(&dir.path().join("s.data"), &[1u8; 1024]);
        let mut journal = ShadowJournal::new(1024, 256, dir.path().join("s.backup")).unwrap();

        journal.copy(&mut source, 600, 10).unwrap();
        assert!(journal.is_page_saved(0));
        assert!(journal.is_page_saved(2));
        assert_eq!(journal.saved_pages(), 2);

        let mut bytes = Vec::new();
        journal.reader().unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(&bytes[4..12], &0i64.to_be_bytes());
        let second = RECORD_HEADER_SIZE + 256;
        assert_eq!(&bytes[second + 4..second + 12], &512i64.to_be_bytes());
    }

    #[test]
    fn test_offsets_past_limit_ignored() {
        let dir = tempdir().unwrap();
        let mut source = source_with(&dir.path().join("s.data"), &[1u8; 2048]);
        let mut journal = ShadowJournal::new(512, 256, dir.path().join("s.backup")).unwrap();

        journal.copy(&mut source, 1024, 64).unwrap();
        // Only the unconditional page 0
        assert_eq!(journal.saved_pages(), 1);

        // A range straddling the limit is clipped to it
        journal.copy(&mut source, 300, 1000).unwrap();
        assert_eq!(journal.saved_pages(), 2);
    }

    #[test]
    fn test_short_last_page_is_padded() {
        let dir = tempdir().unwrap();
        let mut source = source_with(&dir.path().join("s.data"), &[9u8; 100]);
        let mut journal = ShadowJournal::new(100, 64, dir.path().join("s.backup")).unwrap();

        journal.copy(&mut source, 64, 36).unwrap();
        assert_eq!(journal.saved_length(), 2 * (RECORD_HEADER_SIZE + 64) as u64);

        let mut bytes = Vec::new();
        journal.reader().unwrap().read_to_end(&mut bytes).unwrap();
        let payload = &bytes[2 * RECORD_HEADER_SIZE + 64..];
        assert_eq!(&payload[..36], &[9u8; 36]);
        assert_eq!(&payload[36..], &[0u8; 28]);
    }

    #[test]
    fn test_restore_overwrites_corrupted_pages() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("r.data");
        let backup_path = dir.path().join("r.backup");

        let mut original = vec![0xAAu8; 64];
        original.extend_from_slice(&[0xBBu8; 64]);
        let mut source = source_with(&data_path, &original);

        let mut journal = ShadowJournal::new(128, 64, &backup_path).unwrap();
        journal.copy(&mut source, 0, 128).unwrap();
        journal.close().unwrap();

        source.seek(0).unwrap();
        source.write(&[0x11u8; 128]).unwrap();
        source.close().unwrap();

        ShadowJournal::restore_file(&backup_path, &data_path).unwrap();

        let restored = std::fs::read(&data_path).unwrap();
        assert_eq!(&restored[..64], &[0xAAu8; 64]);
        assert_eq!(&restored[64..128], &[0xBBu8; 64]);
    }

    #[test]
    fn test_restore_ignores_torn_tail() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("t.data");
        let backup_path = dir.path().join("t.backup");
        std::fs::write(&data_path, [0u8; 64]).unwrap();

        let mut journal_bytes = Vec::new();
        journal_bytes.extend_from_slice(&64i32.to_be_bytes());
        journal_bytes.extend_from_slice(&0i64.to_be_bytes());
        journal_bytes.extend_from_slice(&[5u8; 64]);
        journal_bytes.extend_from_slice(&64i32.to_be_bytes());
        journal_bytes.extend_from_slice(&64i64.to_be_bytes());
        journal_bytes.extend_from_slice(&[6u8; 10]);
        std::fs::write(&backup_path, &journal_bytes).unwrap();

        ShadowJournal::restore_file(&backup_path, &data_path).unwrap();
        assert_eq!(std::fs::read(&data_path).unwrap(), vec![5u8; 64]);
    }

    #[test]
    fn test_failed_copy_rolls_back_bit() {
        let dir = tempdir().unwrap();
        let mut source = source_with(&dir.path().join("f.data"), &[3u8; 256]);
        let mut journal = ShadowJournal::new(256, 64, dir.path().join("f.backup")).unwrap();

        journal.copy(&mut source, 0, 64).unwrap();
        let before = journal.saved_length();

        source.close().unwrap();
        assert!(journal.copy(&mut source, 128, 10).is_err());
        assert!(!journal.is_page_saved(2));
        assert_eq!(journal.saved_length(), before);
        assert_eq!(std::fs::metadata(journal.path()).unwrap().len(), before);
    }
}
