use crate::index::ORDER;
use crate::storage::record::RecordLayout;

/// Default width of one fixed field slot in bytes.
pub const DEFAULT_FIELD_WIDTH: usize = 50;
/// Default number of non-key fields in a fixed-width record.
pub const DEFAULT_FIELD_COUNT: usize = 9;
/// Default payload cap for the length-prefixed format.
pub const DEFAULT_MAX_PAYLOAD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeConfig {
    /// Maximum keys per node before a split is forced.
    pub order: usize,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig { order: ORDER }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RecordFormat {
    Fixed(RecordLayout),
    LengthPrefixed { max_payload: usize },
}

impl Default for RecordFormat {
    fn default() -> Self {
        RecordFormat::Fixed(RecordLayout::uniform(
            DEFAULT_FIELD_COUNT,
            DEFAULT_FIELD_WIDTH,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct TableOptions {
    pub format: RecordFormat,
    /// Maintain `<table>.idx` and prefer it over a full scan when reopening.
    pub index_side_file: bool,
    /// Call `sync_data` after every write.
    pub sync_on_write: bool,
    pub btree: BTreeConfig,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            format: RecordFormat::default(),
            index_side_file: false,
            sync_on_write: false,
            btree: BTreeConfig::default(),
        }
    }
}

impl TableOptions {
    pub fn length_prefixed() -> Self {
        TableOptions {
            format: RecordFormat::LengthPrefixed {
                max_payload: DEFAULT_MAX_PAYLOAD,
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogOptions {
    pub default_field_width: usize,
    pub index_side_file: bool,
    pub sync_on_write: bool,
    pub btree: BTreeConfig,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        CatalogOptions {
            default_field_width: DEFAULT_FIELD_WIDTH,
            index_side_file: false,
            sync_on_write: false,
            btree: BTreeConfig::default(),
        }
    }
}
