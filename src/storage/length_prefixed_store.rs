use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{RecStoreError, RecStoreResult};
use crate::storage::codec::CommonCodec;
use crate::storage::record::{Offset, Record, KEY_SIZE};
use crate::storage::record_store::{
    open_data_file, read_exact_at, read_fully, RecordStore, Replay,
};

const LEN_SIZE: usize = 2;
const RECORD_HEADER_SIZE: usize = KEY_SIZE + LEN_SIZE;
const PREAMBLE_LEN_SIZE: usize = 4;

/// Append-only file of `i64 key | u16 len | len bytes`, after a
/// `u32 header_len | header` preamble written when the file is created.
#[derive(Debug)]
pub struct LengthPrefixedStore {
    file: Mutex<File>,
    data_start: u64,
    max_payload: usize,
    sync_on_write: bool,
}

impl LengthPrefixedStore {
    pub fn try_new(
        path: impl AsRef<Path>,
        preamble: &[u8],
        max_payload: usize,
        sync_on_write: bool,
    ) -> RecStoreResult<Self> {
        if max_payload > u16::MAX as usize {
            return Err(RecStoreError::InvalidArgument(format!(
                "max payload {} does not fit a u16 length",
                max_payload
            )));
        }
        let mut file = open_data_file(path.as_ref())?;
        let data_start = if file.metadata()?.len() == 0 {
            let header_len = u32::try_from(preamble.len()).map_err(|_| {
                RecStoreError::InvalidArgument("preamble too large".to_string())
            })?;
            file.write_all(&CommonCodec::encode_u32(header_len))?;
            file.write_all(preamble)?;
            file.sync_data()?;
            debug!(
                "initialized length-prefixed file {:?} with {} byte preamble",
                path.as_ref(),
                preamble.len()
            );
            (PREAMBLE_LEN_SIZE + preamble.len()) as u64
        } else {
            let mut buf = [0u8; PREAMBLE_LEN_SIZE];
            read_exact_at(&mut file, 0, &mut buf)?;
            let (header_len, _) = CommonCodec::decode_u32(&buf)?;
            let data_start = PREAMBLE_LEN_SIZE as u64 + header_len as u64;
            if data_start > file.metadata()?.len() {
                return Err(RecStoreError::Corrupt(format!(
                    "preamble of {} bytes runs past end of file",
                    header_len
                )));
            }
            data_start
        };
        Ok(Self {
            file: Mutex::new(file),
            data_start,
            max_payload,
            sync_on_write,
        })
    }

    pub fn preamble(&self) -> RecStoreResult<Vec<u8>> {
        let mut buf = vec![0u8; self.data_start as usize - PREAMBLE_LEN_SIZE];
        let mut file = self.file.lock();
        read_exact_at(&mut file, PREAMBLE_LEN_SIZE as u64, &mut buf)?;
        Ok(buf)
    }

    fn encode(&self, record: &Record) -> RecStoreResult<Vec<u8>> {
        if record.payload.len() > self.max_payload {
            return Err(RecStoreError::InvalidArgument(format!(
                "payload is {} bytes, limit is {}",
                record.payload.len(),
                self.max_payload
            )));
        }
        let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE + record.payload.len());
        bytes.extend(CommonCodec::encode_i64(record.key));
        bytes.extend(CommonCodec::encode_u16(record.payload.len() as u16));
        bytes.extend_from_slice(&record.payload);
        Ok(bytes)
    }

    fn check_offset(&self, offset: Offset) -> RecStoreResult<()> {
        if offset < self.data_start {
            return Err(RecStoreError::InvalidArgument(format!(
                "offset {} lies inside the {} byte preamble",
                offset, self.data_start
            )));
        }
        Ok(())
    }

    /// Key and payload length of the record at `offset`.
    fn read_header(file: &mut File, offset: Offset) -> RecStoreResult<(i64, usize)> {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        read_exact_at(file, offset, &mut buf)?;
        let (key, consumed) = CommonCodec::decode_i64(&buf)?;
        let (len, _) = CommonCodec::decode_u16(&buf[consumed..])?;
        Ok((key, len as usize))
    }

    fn overwrite(&self, offset: Offset, record: &Record) -> RecStoreResult<()> {
        self.check_offset(offset)?;
        let bytes = self.encode(record)?;
        let mut file = self.file.lock();
        let (_, existing_len) = Self::read_header(&mut file, offset)?;
        if existing_len != record.payload.len() {
            return Err(RecStoreError::InvalidArgument(format!(
                "record at offset {} holds {} bytes, cannot overwrite with {}",
                offset,
                existing_len,
                record.payload.len()
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&bytes)?;
        if self.sync_on_write {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl RecordStore for LengthPrefixedStore {
    fn append(&self, record: &Record) -> RecStoreResult<Offset> {
        let bytes = self.encode(record)?;
        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&bytes)?;
        if self.sync_on_write {
            file.sync_data()?;
        }
        Ok(offset)
    }

    fn write_at(&self, offset: Offset, record: &Record) -> RecStoreResult<()> {
        self.overwrite(offset, record)
    }

    fn tombstone_at(&self, offset: Offset) -> RecStoreResult<()> {
        self.check_offset(offset)?;
        let len = {
            let mut file = self.file.lock();
            Self::read_header(&mut file, offset)?.1
        };
        self.overwrite(offset, &Record::tombstone(len))
    }

    fn read_at(&self, offset: Offset) -> RecStoreResult<Record> {
        self.check_offset(offset)?;
        let mut file = self.file.lock();
        let (key, len) = Self::read_header(&mut file, offset)?;
        let mut payload = vec![0u8; len];
        let actual = read_fully(&mut *file, &mut payload)?;
        if actual < len {
            return Err(RecStoreError::ShortRead {
                offset,
                expected: RECORD_HEADER_SIZE + len,
                actual: RECORD_HEADER_SIZE + actual,
            });
        }
        Ok(Record::new(key, payload))
    }

    fn replay_all(&self) -> RecStoreResult<Replay> {
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(self.data_start))?;

        let mut reader = BufReader::new(&mut *file);
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let mut replay = Replay {
            valid_len: self.data_start,
            file_len,
            ..Default::default()
        };
        loop {
            let read = read_fully(&mut reader, &mut header)?;
            if read == 0 {
                break;
            }
            if read < RECORD_HEADER_SIZE {
                warn!("ignoring torn record header at offset {}", replay.valid_len);
                break;
            }
            let (key, consumed) = CommonCodec::decode_i64(&header)?;
            let (len, _) = CommonCodec::decode_u16(&header[consumed..])?;
            let skipped = std::io::copy(
                &mut (&mut reader).take(len as u64),
                &mut std::io::sink(),
            )?;
            if skipped < len as u64 {
                warn!("ignoring torn record payload at offset {}", replay.valid_len);
                break;
            }
            if key != 0 {
                replay.entries.push((key, replay.valid_len));
            }
            replay.valid_len += (RECORD_HEADER_SIZE + len as usize) as u64;
        }
        debug!(
            "replayed {} live records, {} of {} bytes valid",
            replay.entries.len(),
            replay.valid_len,
            replay.file_len
        );
        Ok(replay)
    }

    fn data_start(&self) -> Offset {
        self.data_start
    }

    fn record_end(&self, offset: Offset) -> RecStoreResult<Offset> {
        self.check_offset(offset)?;
        let mut file = self.file.lock();
        let (_, len) = Self::read_header(&mut file, offset)?;
        Ok(offset + (RECORD_HEADER_SIZE + len) as u64)
    }

    fn truncate(&self, len: u64) -> RecStoreResult<()> {
        if len < self.data_start {
            return Err(RecStoreError::InvalidArgument(format!(
                "cannot truncate into the {} byte preamble",
                self.data_start
            )));
        }
        self.file.lock().set_len(len)?;
        Ok(())
    }

    fn lock_handle(&self) -> RecStoreResult<File> {
        Ok(self.file.lock().try_clone()?)
    }

    fn len_bytes(&self) -> RecStoreResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn sync(&self) -> RecStoreResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LengthPrefixedStore;
    use crate::error::RecStoreError;
    use crate::storage::record::Record;
    use crate::storage::record_store::RecordStore;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn records_follow_the_preamble() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.tbl");
        let store = LengthPrefixedStore::try_new(&path, b"people", 256, false).unwrap();
        assert_eq!(store.data_start(), 10);

        let first = store.append(&Record::text(5, "hello")).unwrap();
        let second = store.append(&Record::text(-3, "")).unwrap();
        assert_eq!(first, 10);
        assert_eq!(second, 10 + 10 + 5);
        assert_eq!(store.read_at(first).unwrap().as_text(), "hello");
        assert_eq!(store.read_at(second).unwrap(), Record::text(-3, ""));
        drop(store);

        let store = LengthPrefixedStore::try_new(&path, b"ignored", 256, false).unwrap();
        assert_eq!(store.preamble().unwrap(), b"people".to_vec());
        let replay = store.replay_all().unwrap();
        assert_eq!(replay.entries, vec![(5, 10), (-3, 25)]);
        assert_eq!(store.record_end(first).unwrap(), second);
        assert_eq!(store.record_end(second).unwrap(), store.len_bytes().unwrap());
    }

    #[test]
    fn tombstone_keeps_record_length() {
        let temp_dir = TempDir::new().unwrap();
        let store =
            LengthPrefixedStore::try_new(temp_dir.path().join("t.tbl"), b"", 256, false).unwrap();
        let a = store.append(&Record::text(1, "aaa")).unwrap();
        let b = store.append(&Record::text(2, "bbbb")).unwrap();

        store.tombstone_at(a).unwrap();
        let dead = store.read_at(a).unwrap();
        assert!(dead.is_tombstone());
        assert_eq!(dead.payload, vec![0, 0, 0]);

        let replay = store.replay_all().unwrap();
        assert_eq!(replay.entries, vec![(2, b)]);
    }

    #[test]
    fn overwrite_requires_same_length() {
        let temp_dir = TempDir::new().unwrap();
        let store =
            LengthPrefixedStore::try_new(temp_dir.path().join("t.tbl"), b"", 8, false).unwrap();
        let off = store.append(&Record::text(1, "abc")).unwrap();

        store.write_at(off, &Record::text(1, "xyz")).unwrap();
        assert_eq!(store.read_at(off).unwrap().as_text(), "xyz");
        assert!(matches!(
            store.write_at(off, &Record::text(1, "longer")),
            Err(RecStoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.append(&Record::text(2, "way too long")),
            Err(RecStoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read_at(0),
            Err(RecStoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn torn_payload_is_not_replayed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.tbl");
        let store = LengthPrefixedStore::try_new(&path, b"", 256, false).unwrap();
        store.append(&Record::text(1, "ok")).unwrap();
        let valid = store.len_bytes().unwrap();
        drop(store);

        // header announcing 9 bytes, only 2 present
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&2i64.to_le_bytes()).unwrap();
        raw.write_all(&9u16.to_le_bytes()).unwrap();
        raw.write_all(b"ab").unwrap();
        drop(raw);

        let store = LengthPrefixedStore::try_new(&path, b"", 256, false).unwrap();
        let replay = store.replay_all().unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.valid_len, valid);
        assert!(replay.has_torn_tail());
        assert!(matches!(
            store.read_at(valid),
            Err(RecStoreError::ShortRead { .. })
        ));
    }
}
