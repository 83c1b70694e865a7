use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{RecStoreError, RecStoreResult};
use crate::storage::record::{Key, Offset};

/// Offset written for a removed key.
const REMOVED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEntry {
    Put(Key, Offset),
    Remove(Key),
}

/// Append-only text log of index mutations, one `"<key> <offset>\n"` per line.
///
/// A removal is logged as `"<key> -1"`. Replaying the lines in order rebuilds
/// the index without scanning the data file.
#[derive(Debug)]
pub struct IndexSideFile {
    path: PathBuf,
    file: File,
    sync_on_write: bool,
}

impl IndexSideFile {
    /// `<data file>.idx` next to the data file.
    pub fn path_for(data_path: &Path) -> PathBuf {
        data_path.with_extension("idx")
    }

    pub fn open(path: impl AsRef<Path>, sync_on_write: bool) -> RecStoreResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file,
            sync_on_write,
        })
    }

    /// Reads every entry, or `None` when no side file exists yet.
    pub fn load(path: impl AsRef<Path>) -> RecStoreResult<Option<Vec<SideEntry>>> {
        let file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_line(&line).ok_or_else(|| {
                RecStoreError::Corrupt(format!(
                    "{:?} line {}: malformed entry {:?}",
                    path.as_ref(),
                    lineno + 1,
                    line
                ))
            })?);
        }
        Ok(Some(entries))
    }

    /// Replaces the side file with one `Put` line per entry.
    pub fn rewrite(
        path: impl AsRef<Path>,
        entries: impl IntoIterator<Item = (Key, Offset)>,
        sync_on_write: bool,
    ) -> RecStoreResult<Self> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("idx.tmp");
        let mut count = 0usize;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for (key, offset) in entries {
                writeln!(writer, "{} {}", key, offset)?;
                count += 1;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        debug!("rewrote index side file {:?} with {} entries", path, count);
        Self::open(path, sync_on_write)
    }

    pub fn append_put(&mut self, key: Key, offset: Offset) -> RecStoreResult<()> {
        self.append_line(&format!("{} {}\n", key, offset))
    }

    pub fn append_remove(&mut self, key: Key) -> RecStoreResult<()> {
        self.append_line(&format!("{} {}\n", key, REMOVED))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&self) -> RecStoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn append_line(&mut self, line: &str) -> RecStoreResult<()> {
        self.file.write_all(line.as_bytes())?;
        if self.sync_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<SideEntry> {
    let mut parts = line.split_whitespace();
    let key: Key = parts.next()?.parse().ok()?;
    let offset: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || key == 0 {
        return None;
    }
    match offset {
        REMOVED => Some(SideEntry::Remove(key)),
        o if o >= 0 => Some(SideEntry::Put(key, o as Offset)),
        _ => None,
    }
}
