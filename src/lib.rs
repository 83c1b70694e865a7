//! File-backed record store with an in-memory B+-tree index per table.
//!
//! Each table is one binary record file. Opening a table replays the file
//! into a fresh [`index::BPlusTreeIndex`] mapping keys to byte offsets; every
//! operation then coordinates the advisory file lock, the record file and the
//! index through [`table::TableEngine`].

pub mod catalog;
pub mod config;
pub mod error;
pub mod index;
pub mod storage;
pub mod table;

pub use catalog::{Catalog, TableHandle};
pub use error::{RecStoreError, RecStoreResult};
pub use storage::record::{Key, Offset, Record, RecordLayout};
pub use table::TableEngine;
