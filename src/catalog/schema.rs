use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::{CatalogOptions, RecordFormat, TableOptions, DEFAULT_MAX_PAYLOAD};
use crate::error::{RecStoreError, RecStoreResult};
use crate::storage::record::RecordLayout;

pub const MAX_TABLE_NAME: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ColumnType {
    Int,
    Float,
    Varchar,
}

#[derive(derive_new::new, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnType,
    /// Field width in bytes; 0 means the catalog default.
    pub size: usize,
}

/// How a table lays out its rows on disk. Kept outside the record file itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key_index: usize,
    pub format: RecordFormat,
}

impl TableSchema {
    /// Fixed-width table: every column but the primary key becomes one field slot.
    pub fn fixed(
        name: impl Into<String>,
        columns: Vec<ColumnDef>,
        primary_key_index: usize,
        default_field_width: usize,
    ) -> RecStoreResult<Self> {
        let widths = columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != primary_key_index)
            .map(|(_, col)| {
                if col.size == 0 {
                    default_field_width
                } else {
                    col.size
                }
            })
            .collect();
        let schema = Self {
            name: name.into(),
            columns,
            primary_key_index,
            format: RecordFormat::Fixed(RecordLayout::new(widths)),
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Key plus one length-prefixed text value.
    pub fn length_prefixed(name: impl Into<String>, max_payload: Option<usize>) -> RecStoreResult<Self> {
        let schema = Self {
            name: name.into(),
            columns: vec![
                ColumnDef::new("id".to_string(), ColumnType::Int, 8),
                ColumnDef::new("text".to_string(), ColumnType::Varchar, 0),
            ],
            primary_key_index: 0,
            format: RecordFormat::LengthPrefixed {
                max_payload: max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD),
            },
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> RecStoreResult<()> {
        let name_ok = !self.name.is_empty()
            && self.name.len() <= MAX_TABLE_NAME
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !name_ok {
            return Err(RecStoreError::InvalidArgument(format!(
                "invalid table name {:?}",
                self.name
            )));
        }
        let Some(pk) = self.columns.get(self.primary_key_index) else {
            return Err(RecStoreError::InvalidArgument(format!(
                "primary key index {} out of range for {} columns",
                self.primary_key_index,
                self.columns.len()
            )));
        };
        if pk.kind != ColumnType::Int {
            return Err(RecStoreError::InvalidArgument(format!(
                "primary key column {} must be INT, found {}",
                pk.name, pk.kind
            )));
        }
        for (idx, col) in self.columns.iter().enumerate() {
            let clash = self.columns[..idx]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&col.name));
            if clash {
                return Err(RecStoreError::InvalidArgument(format!(
                    "duplicate column {}",
                    col.name
                )));
            }
        }
        Ok(())
    }

    /// Data file name inside the catalog directory.
    pub fn file_name(&self) -> String {
        match self.format {
            RecordFormat::Fixed(_) => format!("{}.dat", self.name),
            RecordFormat::LengthPrefixed { .. } => format!("{}.tbl", self.name),
        }
    }

    /// Columns stored in the payload, in field order.
    pub fn payload_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .enumerate()
            .filter(move |(idx, _)| *idx != self.primary_key_index)
            .map(|(_, col)| col)
    }

    pub fn table_options(&self, options: &CatalogOptions) -> TableOptions {
        TableOptions {
            format: self.format.clone(),
            index_side_file: options.index_side_file,
            sync_on_write: options.sync_on_write,
            btree: options.btree,
        }
    }
}
