use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{RecStoreError, RecStoreResult};
use crate::storage::record::{Key, Offset, Record};

/// Result of scanning a data file from start to end.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Replay {
    /// Live records in file order.
    pub entries: Vec<(Key, Offset)>,
    /// Bytes covered by complete records, header included.
    pub valid_len: u64,
    pub file_len: u64,
}

impl Replay {
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Binary record file addressed by byte offset.
///
/// Implementations own the data file and serialize access to its cursor
/// internally, so every method takes `&self`. Cross-process exclusion is the
/// caller's job (see [`crate::storage::lock::ConcurrencyGuard`]).
pub trait RecordStore: Send + Sync + fmt::Debug {
    /// Writes `record` at end-of-file and returns its offset.
    fn append(&self, record: &Record) -> RecStoreResult<Offset>;

    /// Overwrites the record at `offset` in place.
    fn write_at(&self, offset: Offset, record: &Record) -> RecStoreResult<()>;

    /// Zero-writes the record at `offset`, leaving a tombstone.
    fn tombstone_at(&self, offset: Offset) -> RecStoreResult<()>;

    fn read_at(&self, offset: Offset) -> RecStoreResult<Record>;

    /// Scans the whole file, skipping tombstones.
    fn replay_all(&self) -> RecStoreResult<Replay>;

    /// Offset of the first record, past any file header.
    fn data_start(&self) -> Offset;

    /// Offset just past the record stored at `offset`, tombstones included.
    fn record_end(&self, offset: Offset) -> RecStoreResult<Offset>;

    /// Cuts the file back to `len` bytes, dropping a torn trailing record.
    fn truncate(&self, len: u64) -> RecStoreResult<()>;

    /// A duplicated handle sharing the store's open file description.
    fn lock_handle(&self) -> RecStoreResult<File>;

    fn len_bytes(&self) -> RecStoreResult<u64>;

    fn sync(&self) -> RecStoreResult<()>;
}

pub(crate) fn open_data_file(path: &Path) -> RecStoreResult<File> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(file)
}

/// Fills as much of `buf` as the reader can supply and returns the byte count.
pub(crate) fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> RecStoreResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Positions `file` at `offset` and reads exactly `buf.len()` bytes.
pub(crate) fn read_exact_at(file: &mut File, offset: Offset, buf: &mut [u8]) -> RecStoreResult<()> {
    file.seek(SeekFrom::Start(offset))?;
    let actual = read_fully(file, buf)?;
    if actual < buf.len() {
        return Err(RecStoreError::ShortRead {
            offset,
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{open_data_file, read_exact_at};
    use crate::error::RecStoreError;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn short_read_reports_available_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let mut file = open_data_file(&temp_dir.path().join("t.dat")).unwrap();
        file.write_all(&[1, 2, 3, 4, 5]).unwrap();

        let mut buf = [0u8; 4];
        read_exact_at(&mut file, 1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3, 4, 5]);

        match read_exact_at(&mut file, 3, &mut buf) {
            Err(RecStoreError::ShortRead {
                offset,
                expected,
                actual,
            }) => assert_eq!((offset, expected, actual), (3, 4, 2)),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
