use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{RecStoreError, RecStoreResult};
use crate::storage::codec::CommonCodec;
use crate::storage::record::{Offset, Record, RecordLayout, KEY_SIZE};
use crate::storage::record_store::{
    open_data_file, read_exact_at, read_fully, RecordStore, Replay,
};

/// Headerless file of fixed-size slots: `i64 key | field bytes`.
/// Slot `n` lives at `n * slot_size`; a zero key marks a deleted slot.
#[derive(Debug)]
pub struct FixedSlotStore {
    file: Mutex<File>,
    layout: RecordLayout,
    slot_size: usize,
    sync_on_write: bool,
}

impl FixedSlotStore {
    pub fn try_new(
        path: impl AsRef<Path>,
        layout: RecordLayout,
        sync_on_write: bool,
    ) -> RecStoreResult<Self> {
        let file = open_data_file(path.as_ref())?;
        let slot_size = layout.slot_size();
        Ok(Self {
            file: Mutex::new(file),
            layout,
            slot_size,
            sync_on_write,
        })
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    fn check_offset(&self, offset: Offset) -> RecStoreResult<()> {
        if offset % self.slot_size as u64 != 0 {
            return Err(RecStoreError::InvalidArgument(format!(
                "offset {} is not aligned to slot size {}",
                offset, self.slot_size
            )));
        }
        Ok(())
    }

    fn encode(&self, record: &Record) -> RecStoreResult<Vec<u8>> {
        if record.payload.len() != self.layout.payload_size() {
            return Err(RecStoreError::InvalidArgument(format!(
                "payload is {} bytes, layout expects {}",
                record.payload.len(),
                self.layout.payload_size()
            )));
        }
        let mut bytes = Vec::with_capacity(self.slot_size);
        bytes.extend(CommonCodec::encode_i64(record.key));
        bytes.extend_from_slice(&record.payload);
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> RecStoreResult<Record> {
        let (key, offset) = CommonCodec::decode_i64(bytes)?;
        Ok(Record::new(key, bytes[offset..self.slot_size].to_vec()))
    }

    fn write_slot(&self, file: &mut File, offset: Offset, bytes: &[u8]) -> RecStoreResult<()> {
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        if self.sync_on_write {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl RecordStore for FixedSlotStore {
    fn append(&self, record: &Record) -> RecStoreResult<Offset> {
        let bytes = self.encode(record)?;
        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        self.check_offset(offset).map_err(|_| {
            RecStoreError::Corrupt(format!(
                "file length {} is not a multiple of slot size {}",
                offset, self.slot_size
            ))
        })?;
        self.write_slot(&mut file, offset, &bytes)?;
        Ok(offset)
    }

    fn write_at(&self, offset: Offset, record: &Record) -> RecStoreResult<()> {
        self.check_offset(offset)?;
        let bytes = self.encode(record)?;
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        if offset + self.slot_size as u64 > file_len {
            return Err(RecStoreError::InvalidArgument(format!(
                "offset {} is past the last slot (file length {})",
                offset, file_len
            )));
        }
        self.write_slot(&mut file, offset, &bytes)
    }

    fn tombstone_at(&self, offset: Offset) -> RecStoreResult<()> {
        self.write_at(offset, &Record::tombstone(self.layout.payload_size()))
    }

    fn read_at(&self, offset: Offset) -> RecStoreResult<Record> {
        self.check_offset(offset)?;
        let mut buf = vec![0u8; self.slot_size];
        {
            let mut file = self.file.lock();
            read_exact_at(&mut file, offset, &mut buf)?;
        }
        self.decode(&buf)
    }

    fn replay_all(&self) -> RecStoreResult<Replay> {
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;

        let mut reader = BufReader::new(&mut *file);
        let mut buf = vec![0u8; self.slot_size];
        let mut replay = Replay {
            file_len,
            ..Default::default()
        };
        loop {
            let read = read_fully(&mut reader, &mut buf)?;
            if read == 0 {
                break;
            }
            if read < self.slot_size {
                warn!(
                    "ignoring partial slot of {} bytes at offset {}",
                    read, replay.valid_len
                );
                break;
            }
            let (key, _) = CommonCodec::decode_i64(&buf[..KEY_SIZE])?;
            if key != 0 {
                replay.entries.push((key, replay.valid_len));
            }
            replay.valid_len += self.slot_size as u64;
        }
        debug!(
            "replayed {} live slots out of {} bytes",
            replay.entries.len(),
            replay.valid_len
        );
        Ok(replay)
    }

    fn data_start(&self) -> Offset {
        0
    }

    fn record_end(&self, offset: Offset) -> RecStoreResult<Offset> {
        self.check_offset(offset)?;
        Ok(offset + self.slot_size as u64)
    }

    fn truncate(&self, len: u64) -> RecStoreResult<()> {
        self.check_offset(len)?;
        let file = self.file.lock();
        file.set_len(len)?;
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
