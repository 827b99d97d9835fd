//! Whole-file backup, used when incremental backup is off.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use tracing::info;

use crate::common::{Error, Result};

/// First bytes of a full copy. A shadow journal starts with a positive
/// record size, so the leading `0xFF` never appears there.
pub const FULL_COPY_MAGIC: [u8; 8] = [0xFF, b'F', b'U', b'L', b'L', b'C', b'P', 1];

/// Copy `data` to `backup` behind [`FULL_COPY_MAGIC`].
///
/// The copy is written to `staging` first and renamed over `backup` once
/// synced, so a crash never leaves a truncated backup in place.
///
/// Returns the number of data bytes copied.
pub fn write_full_copy(data: &Path, backup: &Path, staging: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(data)?);
    let mut writer = BufWriter::new(File::create(staging)?);
    writer.write_all(&FULL_COPY_MAGIC)?;
    let copied = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(staging, backup)?;
    info!(
        data = %data.display(),
        backup = %backup.display(),
        bytes = copied,
        "full backup written"
    );
    Ok(copied)
}

/// Whether `backup` holds a full copy rather than a shadow journal.
pub fn is_full_copy(backup: &Path) -> Result<bool> {
    let mut magic = [0u8; FULL_COPY_MAGIC.len()];
    match File::open(backup)?.read_exact(&mut magic) {
        Ok(()) => Ok(magic == FULL_COPY_MAGIC),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Replace `target` with the data held in the full copy at `backup`.
pub fn restore_full_copy(backup: &Path, target: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(backup)?);
    let mut magic = [0u8; FULL_COPY_MAGIC.len()];
    reader.read_exact(&mut magic)?;
    if magic != FULL_COPY_MAGIC {
        return Err(Error::DataFileCorrupt(format!(
            "{} is not a full backup",
            backup.display()
        )));
    }

    let mut dest = File::create(target)?;
    let copied = io::copy(&mut reader, &mut dest)?;
    dest.sync_all()?;
    info!(
        backup = %backup.display(),
        target = %target.display(),
        bytes = copied,
        "restored data file from full backup"
    );
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_and_restore() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("f.data");
        let backup = dir.path().join("f.backup");
        let staging = dir.path().join("f.backup.new");
        fs::write(&data, b"checkpointed contents").unwrap();

        assert_eq!(write_full_copy(&data, &backup, &staging).unwrap(), 21);
        assert!(!staging.exists());
        assert!(is_full_copy(&backup).unwrap());

        fs::write(&data, b"changed after the checkpoint, and longer").unwrap();
        restore_full_copy(&backup, &data).unwrap();
        assert_eq!(fs::read(&data).unwrap(), b"checkpointed contents");
    }

    #[test]
    fn test_journal_is_not_a_full_copy() {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("j.backup");

        // One journal record header: size 512 at position 0
        let mut record = 512i32.to_be_bytes().to_vec();
        record.extend_from_slice(&0i64.to_be_bytes());
        fs::write(&backup, &record).unwrap();
        assert!(!is_full_copy(&backup).unwrap());

        fs::write(&backup, b"").unwrap();
        assert!(!is_full_copy(&backup).unwrap());
        assert!(matches!(
            restore_full_copy(&backup, &dir.path().join("j.data")),
            Err(Error::Io(_))
        ));
    }
}
