use crate::error::RecStoreResult;
use crate::index::RangeIter;
use crate::storage::record::Record;
use crate::table::engine::TableEngine;

/// Lazily reads the records behind an index range.
///
/// Slots tombstoned by another process since the index was built are skipped.
#[derive(Debug)]
pub struct TableScan<'a> {
    table: &'a TableEngine,
    inner: RangeIter<'a>,
    failed: bool,
}

impl<'a> TableScan<'a> {
    pub(crate) fn new(table: &'a TableEngine, inner: RangeIter<'a>) -> Self {
        Self {
            table,
            inner,
            failed: false,
        }
    }
}

impl Iterator for TableScan<'_> {
    type Item = RecStoreResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        for (key, offset) in self.inner.by_ref() {
            match self.table.read_for_scan(key, offset) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
