use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use log::warn;

use crate::catalog::schema::TableSchema;
use crate::error::{RecStoreError, RecStoreResult};
use crate::storage::codec::CommonCodec;

pub const SCHEMA_FILE_NAME: &str = "schemas.dat";
/// Every schema occupies one slot of this size: `u32 len | bincode | zero padding`.
pub const SCHEMA_SLOT_SIZE: usize = 512;

pub fn encode_schema(schema: &TableSchema) -> RecStoreResult<Vec<u8>> {
    let body = bincode::serialize(schema)?;
    if body.len() + 4 > SCHEMA_SLOT_SIZE {
        return Err(RecStoreError::InvalidArgument(format!(
            "schema for {} needs {} bytes, slot holds {}",
            schema.name,
            body.len() + 4,
            SCHEMA_SLOT_SIZE
        )));
    }
    let mut slot = Vec::with_capacity(SCHEMA_SLOT_SIZE);
    slot.extend(CommonCodec::encode_u32(body.len() as u32));
    slot.extend(body);
    slot.resize(SCHEMA_SLOT_SIZE, 0);
    Ok(slot)
}

pub fn decode_schema(slot: &[u8]) -> RecStoreResult<TableSchema> {
    let (len, offset) = CommonCodec::decode_u32(slot)?;
    let end = offset + len as usize;
    if end > slot.len() {
        return Err(RecStoreError::Corrupt(format!(
            "schema slot claims {} bytes, slot holds {}",
            len,
            slot.len()
        )));
    }
    Ok(bincode::deserialize(&slot[offset..end])?)
}

/// Reads every schema slot in creation order. A missing file is an empty catalog.
pub fn load_schemas(path: &Path) -> RecStoreResult<Vec<TableSchema>> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes)?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    }
    if bytes.len() % SCHEMA_SLOT_SIZE != 0 {
        warn!(
            "{:?} ends with a partial schema slot of {} bytes, ignoring it",
            path,
            bytes.len() % SCHEMA_SLOT_SIZE
        );
    }
    bytes
        .chunks_exact(SCHEMA_SLOT_SIZE)
        .map(decode_schema)
        .collect()
}

pub fn append_schema(path: &Path, schema: &TableSchema) -> RecStoreResult<()> {
    append_slot(path, &encode_schema(schema)?)
}

/// Appends a slot produced by [`encode_schema`].
pub fn append_slot(path: &Path, slot: &[u8]) -> RecStoreResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(slot)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{append_schema, decode_schema, encode_schema, load_schemas, SCHEMA_SLOT_SIZE};
    use crate::catalog::schema::TableSchema;
    use tempfile::TempDir;

    #[test]
    fn schemas_round_trip_through_fixed_slots() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("schemas.dat");
        assert!(load_schemas(&path).unwrap().is_empty());

        let notes = TableSchema::length_prefixed("notes", None).unwrap();
        let logs = TableSchema::length_prefixed("logs", Some(64)).unwrap();
        append_schema(&path, &notes).unwrap();
        append_schema(&path, &logs).unwrap();

        assert_eq!(
            std::fs::metadata(&path).unwrap().len() as usize,
            2 * SCHEMA_SLOT_SIZE
        );
        assert_eq!(load_schemas(&path).unwrap(), vec![notes, logs]);
    }

    #[test]
    fn corrupt_length_is_reported() {
        let schema = TableSchema::length_prefixed("notes", None).unwrap();
        let mut slot = encode_schema(&schema).unwrap();
        slot[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(decode_schema(&slot).is_err());
    }
}
