use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::config::{RecordFormat, TableOptions};
use crate::error::{RecStoreError, RecStoreResult};
use crate::index::{BPlusTreeIndex, IndexSideFile, SideEntry};
use crate::storage::lock::{ConcurrencyGuard, DefaultLock, FileLock};
use crate::storage::record::{check_live_key, Key, Offset, Record};
use crate::storage::{FixedSlotStore, LengthPrefixedStore, RecordStore};
use crate::table::scan::TableScan;

/// Preamble stamped at the head of new length-prefixed files.
pub const LENGTH_PREFIXED_PREAMBLE: &[u8] = b"recstore length-prefixed v1";

/// One table: a record file, the in-memory index over it, and the advisory
/// lock that serializes cross-process access to the file.
///
/// Reads take `&self`, mutations `&mut self`. The index does no locking of its
/// own, so hosts sharing an engine between threads must wrap it in a
/// reader/writer lock (as [`crate::catalog::Catalog`] does).
#[derive(Debug)]
pub struct TableEngine {
    path: PathBuf,
    options: TableOptions,
    store: Box<dyn RecordStore>,
    index: BPlusTreeIndex,
    guard: ConcurrencyGuard,
    side_file: Option<IndexSideFile>,
    poisoned: Mutex<Option<String>>,
}

impl TableEngine {
    pub fn open(path: impl AsRef<Path>, options: TableOptions) -> RecStoreResult<Self> {
        Self::open_with_lock(path, options, Box::new(DefaultLock::default()))
    }

    /// Opens (creating if needed) the table file and rebuilds its index.
    pub fn open_with_lock(
        path: impl AsRef<Path>,
        options: TableOptions,
        lock: Box<dyn FileLock>,
    ) -> RecStoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let store: Box<dyn RecordStore> = match &options.format {
            RecordFormat::Fixed(layout) => Box::new(FixedSlotStore::try_new(
                &path,
                layout.clone(),
                options.sync_on_write,
            )?),
            RecordFormat::LengthPrefixed { max_payload } => Box::new(LengthPrefixedStore::try_new(
                &path,
                LENGTH_PREFIXED_PREAMBLE,
                *max_payload,
                options.sync_on_write,
            )?),
        };
        let guard = ConcurrencyGuard::with_backend(store.lock_handle()?, lock);
        let index = BPlusTreeIndex::with_order(options.btree.order)?;

        let mut engine = TableEngine {
            path,
            options,
            store,
            index,
            guard,
            side_file: None,
            poisoned: Mutex::new(None),
        };
        engine.rebuild_index()?;
        info!(
            "opened table {:?} with {} records (index height {})",
            engine.path,
            engine.index.len(),
            engine.index.height()
        );
        Ok(engine)
    }

    fn rebuild_index(&mut self) -> RecStoreResult<()> {
        let _scope = self.guard.exclusive()?;
        let side_path = IndexSideFile::path_for(&self.path);

        if self.options.index_side_file {
            match load_side_file(self.store.as_ref(), self.options.btree.order, &side_path) {
                Ok(Some(index)) => {
                    debug!(
                        "rebuilt index for {:?} from side file ({} keys)",
                        self.path,
                        index.len()
                    );
                    self.index = index;
                    self.side_file =
                        Some(IndexSideFile::open(&side_path, self.options.sync_on_write)?);
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "index side file {:?} unusable ({}), falling back to full scan",
                    side_path, e
                ),
            }
        }

        let replay = self.store.replay_all()?;
        if replay.has_torn_tail() {
            warn!(
                "dropping {} trailing bytes of a torn record in {:?}",
                replay.file_len - replay.valid_len,
                self.path
            );
            self.store.truncate(replay.valid_len)?;
        }

        let mut index = BPlusTreeIndex::with_order(self.options.btree.order)?;
        for (key, offset) in replay.entries {
            if index.contains(key) {
                warn!(
                    "key {} at offset {} duplicates an earlier record, keeping the first",
                    key, offset
                );
                continue;
            }
            index.insert(key, offset)?;
        }
        debug!("rebuilt index for {:?} from full scan", self.path);
        self.index = index;

        if self.options.index_side_file {
            self.side_file = Some(IndexSideFile::rewrite(
                &side_path,
                self.index.iter(),
                self.options.sync_on_write,
            )?);
        }
        Ok(())
    }

    /// Appends `record` and indexes it. Fails with `DuplicateKey` before
    /// touching the file when the key is already live.
    pub fn insert(&mut self, record: &Record) -> RecStoreResult<Offset> {
        self.check_usable()?;
        check_live_key(record.key)?;
        let result = self.insert_locked(record);
        self.track(result)
    }

    fn insert_locked(&mut self, record: &Record) -> RecStoreResult<Offset> {
        let _scope = self.guard.exclusive()?;
        let live = live_offset(
            self.store.as_ref(),
            &mut self.index,
            &mut self.side_file,
            record.key,
        )?;
        if live.is_some() {
            return Err(RecStoreError::DuplicateKey(record.key));
        }
        let offset = self.store.append(record)?;
        self.index.insert(record.key, offset)?;
        if let Some(side) = self.side_file.as_mut() {
            side.append_put(record.key, offset)?;
        }
        trace!("inserted key={} at offset={}", record.key, offset);
        Ok(offset)
    }

    /// Reads the live record for `key`, if any. Every call returns its own copy.
    pub fn find(&self, key: Key) -> RecStoreResult<Option<Record>> {
        self.check_usable()?;
        check_live_key(key)?;
        let Some(offset) = self.index.find(key) else {
            return Ok(None);
        };
        let result = self.read_checked(key, offset);
        self.track(result)
    }

    /// Offset the index currently maps `key` to.
    pub fn offset_of(&self, key: Key) -> Option<Offset> {
        self.index.find(key)
    }

    fn read_checked(&self, key: Key, offset: Offset) -> RecStoreResult<Option<Record>> {
        let record = {
            let _scope = self.guard.shared()?;
            self.store.read_at(offset)?
        };
        if record.is_tombstone() {
            // removed by another process since this index was built
            return Ok(None);
        }
        if record.key != key {
            return Err(RecStoreError::Corrupt(format!(
                "offset {} holds key {}, index expected {}",
                offset, record.key, key
            )));
        }
        Ok(Some(record))
    }

    /// Overwrites the record for `key` in place. The stored key is always
    /// `key`, whatever `record.key` says, and the offset does not change.
    pub fn update(&mut self, key: Key, record: &Record) -> RecStoreResult<Offset> {
        self.check_usable()?;
        check_live_key(key)?;
        let result = self.update_locked(key, record);
        self.track(result)
    }

    fn update_locked(&mut self, key: Key, record: &Record) -> RecStoreResult<Offset> {
        let _scope = self.guard.exclusive()?;
        let offset = live_offset(self.store.as_ref(), &mut self.index, &mut self.side_file, key)?
            .ok_or(RecStoreError::KeyNotFound(key))?;
        self.store
            .write_at(offset, &Record::new(key, record.payload.clone()))?;
        trace!("updated key={} at offset={}", key, offset);
        Ok(offset)
    }

    /// Tombstones the record for `key` and drops it from the index. The slot
    /// is never reused.
    pub fn delete(&mut self, key: Key) -> RecStoreResult<Offset> {
        self.check_usable()?;
        check_live_key(key)?;
        let result = self.delete_locked(key);
        self.track(result)
    }

    fn delete_locked(&mut self, key: Key) -> RecStoreResult<Offset> {
        let _scope = self.guard.exclusive()?;
        let offset = live_offset(self.store.as_ref(), &mut self.index, &mut self.side_file, key)?
            .ok_or(RecStoreError::KeyNotFound(key))?;
        self.store.tombstone_at(offset)?;
        self.index.delete(key);
        if let Some(side) = self.side_file.as_mut() {
            side.append_remove(key)?;
        }
        trace!("deleted key={} at offset={}", key, offset);
        Ok(offset)
    }

    /// Records with keys in `[min, max]`, ascending, each read under its own
    /// shared lock.
    ///
    /// Keys are signed, so negative bounds are valid; only `min > max` is rejected.
    pub fn scan_range(&self, min: Key, max: Key) -> RecStoreResult<TableScan<'_>> {
        self.check_usable()?;
        if min > max {
            return Err(RecStoreError::InvalidArgument(format!(
                "range start {} is above range end {}",
                min, max
            )));
        }
        Ok(TableScan::new(self, self.index.range(min, max)))
    }

    pub fn scan_all(&self) -> RecStoreResult<TableScan<'_>> {
        self.check_usable()?;
        Ok(TableScan::new(self, self.index.iter()))
    }

    pub(crate) fn read_for_scan(&self, key: Key, offset: Offset) -> RecStoreResult<Option<Record>> {
        let result = self.read_checked(key, offset);
        self.track(result)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    pub fn index(&self) -> &BPlusTreeIndex {
        &self.index
    }

    pub fn file_len(&self) -> RecStoreResult<u64> {
        self.store.len_bytes()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.lock().is_some()
    }

    /// Forces data and side file to disk.
    pub fn flush(&self) -> RecStoreResult<()> {
        self.check_usable()?;
        let result = self.flush_files();
        self.track(result)
    }

    fn flush_files(&self) -> RecStoreResult<()> {
        self.store.sync()?;
        if let Some(side) = self.side_file.as_ref() {
            side.sync()?;
        }
        Ok(())
    }

    /// Flushes and releases the table. The index is dropped with it.
    pub fn close(self) -> RecStoreResult<()> {
        if !self.is_poisoned() {
            self.flush_files()?;
        }
        info!("closed table {:?}", self.path);
        Ok(())
    }

    fn check_usable(&self) -> RecStoreResult<()> {
        match self.poisoned.lock().as_ref() {
            Some(reason) => Err(RecStoreError::TableUnusable(reason.clone())),
            None => Ok(()),
        }
    }

    /// Poisons the table when `result` is an I/O failure.
    fn track<T>(&self, result: RecStoreResult<T>) -> RecStoreResult<T> {
        if let Err(e) = &result {
            if e.is_io_failure() {
                warn!("table {:?} unusable after I/O failure: {}", self.path, e);
                *self.poisoned.lock() = Some(e.to_string());
            }
        }
        result
    }
}

/// Offset of the live record for `key`. An index entry whose slot was
/// tombstoned through another handle is dropped and reported as absent.
/// Callers hold the exclusive lock.
fn live_offset(
    store: &dyn RecordStore,
    index: &mut BPlusTreeIndex,
    side_file: &mut Option<IndexSideFile>,
    key: Key,
) -> RecStoreResult<Option<Offset>> {
    let Some(offset) = index.find(key) else {
        return Ok(None);
    };
    let stored = store.read_at(offset)?;
    if stored.is_tombstone() {
        debug!(
            "key {} at offset {} was deleted elsewhere, dropping it from the index",
            key, offset
        );
        index.delete(key);
        if let Some(side) = side_file.as_mut() {
            side.append_remove(key)?;
        }
        return Ok(None);
    }
    if stored.key != key {
        return Err(RecStoreError::Corrupt(format!(
            "offset {} holds key {}, index expected {}",
            offset, stored.key, key
        )));
    }
    Ok(Some(offset))
}

/// Rebuilds an index from the side file at `side_path`; `None` when there is none.
fn load_side_file(
    store: &dyn RecordStore,
    order: usize,
    side_path: &Path,
) -> RecStoreResult<Option<BPlusTreeIndex>> {
    let Some(entries) = IndexSideFile::load(side_path)? else {
        return Ok(None);
    };
    let file_len = store.len_bytes()?;
    let mut live = BTreeMap::new();
    let mut last_offset = None;
    for entry in entries {
        match entry {
            SideEntry::Put(key, offset) => {
                if offset >= file_len {
                    return Err(RecStoreError::Corrupt(format!(
                        "side file maps key {} past end of data file",
                        key
                    )));
                }
                last_offset = last_offset.max(Some(offset));
                live.insert(key, offset);
            }
            SideEntry::Remove(key) => {
                live.remove(&key);
            }
        }
    }

    // records or torn bytes past the last logged record were never indexed
    let covered = match last_offset {
        Some(offset) => store.record_end(offset)?,
        None => store.data_start(),
    };
    if covered != file_len {
        return Err(RecStoreError::Corrupt(format!(
            "side file covers {} bytes of a {} byte data file",
            covered, file_len
        )));
    }

    let mut index = BPlusTreeIndex::with_order(order)?;
    for (key, offset) in live {
        index.insert(key, offset)?;
    }
    Ok(Some(index))
}

#[cfg(test)]
mod tests {
    use super::TableEngine;
    use crate::config::{RecordFormat, TableOptions};
    use crate::error::RecStoreError;
    use crate::index::IndexSideFile;
    use crate::storage::record::{Record, RecordLayout};
    use tempfile::TempDir;

    fn options() -> TableOptions {
        TableOptions {
            format: RecordFormat::Fixed(RecordLayout::uniform(2, 16)),
            ..Default::default()
        }
    }

    fn record(key: i64, name: &str) -> Record {
        Record::from_fields(key, &[name, "dept"], &RecordLayout::uniform(2, 16)).unwrap()
    }

    #[test]
    fn insert_find_update_delete() {
        let temp_dir = TempDir::new().unwrap();
        let mut table = TableEngine::open(temp_dir.path().join("t.dat"), options()).unwrap();

        let offset = table.insert(&record(7, "ada")).unwrap();
        assert_eq!(table.find(7).unwrap(), Some(record(7, "ada")));

        let updated = table.update(7, &record(99, "grace")).unwrap();
        assert_eq!(updated, offset);
        assert_eq!(table.find(7).unwrap(), Some(record(7, "grace")));

        assert_eq!(table.delete(7).unwrap(), offset);
        assert_eq!(table.find(7).unwrap(), None);
        assert!(matches!(
            table.delete(7),
            Err(RecStoreError::KeyNotFound(7))
        ));
        assert!(matches!(
            table.update(7, &record(7, "x")),
            Err(RecStoreError::KeyNotFound(7))
        ));
    }

    #[test]
    fn preconditions_are_checked_before_io() {
        let temp_dir = TempDir::new().unwrap();
        let mut table = TableEngine::open(temp_dir.path().join("t.dat"), options()).unwrap();

        assert!(matches!(
            table.insert(&record(0, "zero")),
            Err(RecStoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.find(0),
            Err(RecStoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.scan_range(10, 1),
            Err(RecStoreError::InvalidArgument(_))
        ));
        assert_eq!(table.file_len().unwrap(), 0);
        assert!(!table.is_poisoned());
    }

    #[test]
    fn insert_reuses_a_key_deleted_by_another_handle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.dat");
        let mut first = TableEngine::open(&path, options()).unwrap();
        first.insert(&record(1, "a")).unwrap();

        let mut second = TableEngine::open(&path, options()).unwrap();
        first.delete(1).unwrap();

        assert_eq!(second.find(1).unwrap(), None);
        assert_eq!(second.insert(&record(1, "b")).unwrap(), 40);
        assert_eq!(second.len(), 1);
        assert_eq!(second.find(1).unwrap(), Some(record(1, "b")));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.dat");
        let mut table = TableEngine::open(&path, options()).unwrap();
        table.insert(&record(1, "a")).unwrap();
        table.close().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend([1, 2, 3, 4, 5]);
        std::fs::write(&path, bytes).unwrap();

        let mut table = TableEngine::open(&path, options()).unwrap();
        assert_eq!(table.file_len().unwrap(), 40);
        assert_eq!(table.insert(&record(2, "b")).unwrap(), 40);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn side_file_drives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.dat");
        let opts = TableOptions {
            index_side_file: true,
            ..options()
        };

        let mut table = TableEngine::open(&path, opts.clone()).unwrap();
        for key in 1..=10 {
            table.insert(&record(key, "n")).unwrap();
        }
        table.delete(4).unwrap();
        table.close().unwrap();

        let side_path = IndexSideFile::path_for(&path);
        assert!(side_path.exists());

        let table = TableEngine::open(&path, opts.clone()).unwrap();
        let keys: Vec<i64> = table.index().iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3, 5, 6, 7, 8, 9, 10]);
        table.close().unwrap();

        // a broken side file falls back to scanning and is rewritten
        std::fs::write(&side_path, b"garbage\n").unwrap();
        let table = TableEngine::open(&path, opts).unwrap();
        assert_eq!(table.len(), 9);
        assert_eq!(IndexSideFile::load(&side_path).unwrap().unwrap().len(), 9);
    }

    #[test]
    fn side_file_missing_the_tail_triggers_replay() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.dat");
        let opts = TableOptions {
            index_side_file: true,
            ..options()
        };

        let mut table = TableEngine::open(&path, opts.clone()).unwrap();
        table.insert(&record(1, "a")).unwrap();
        table.insert(&record(2, "b")).unwrap();
        table.close().unwrap();

        // record 2 reached the data file but not the side file, then a torn write
        let side_path = IndexSideFile::path_for(&path);
        std::fs::write(&side_path, b"1 0\n").unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend([9, 9, 9]);
        std::fs::write(&path, bytes).unwrap();

        let mut table = TableEngine::open(&path, opts).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.find(2).unwrap(), Some(record(2, "b")));
        assert_eq!(table.insert(&record(3, "c")).unwrap(), 80);
    }

    #[test]
    fn length_prefixed_table() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notes.tbl");
        let mut table = TableEngine::open(&path, TableOptions::length_prefixed()).unwrap();

        table.insert(&Record::text(2, "second")).unwrap();
        table.insert(&Record::text(1, "first")).unwrap();
        table.update(2, &Record::text(2, "SECOND")).unwrap();
        assert!(table.update(1, &Record::text(1, "much longer")).is_err());
        table.close().unwrap();

        let table = TableEngine::open(&path, TableOptions::length_prefixed()).unwrap();
        let texts: Vec<String> = table
            .scan_all()
            .unwrap()
            .map(|r| r.unwrap().as_text())
            .collect();
        assert_eq!(texts, vec!["first", "SECOND"]);
    }
}
