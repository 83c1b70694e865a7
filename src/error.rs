use thiserror::Error;

use crate::storage::record::{Key, Offset};

pub type RecStoreResult<T, E = RecStoreError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum RecStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicate key: {0}")]
    DuplicateKey(Key),

    #[error("Key not found: {0}")]
    KeyNotFound(Key),

    /// Fewer bytes than one record were available at `offset`. This points at
    /// file corruption or a stale offset, never at a missing key.
    #[error("Short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: Offset,
        expected: usize,
        actual: usize,
    },

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Table unusable until reopened: {0}")]
    TableUnusable(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecStoreError {
    /// Errors that leave the on-disk state in doubt and poison the owning table.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, RecStoreError::Io(_))
    }
}
