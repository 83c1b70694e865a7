use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;

use crate::catalog::schema::TableSchema;
use crate::catalog::schema_file::{append_slot, encode_schema, load_schemas, SCHEMA_FILE_NAME};
use crate::config::CatalogOptions;
use crate::error::{RecStoreError, RecStoreResult};
use crate::table::TableEngine;

/// Shared handle to one open table. Readers take the read lock, writers the write lock.
pub type TableHandle = Arc<RwLock<TableEngine>>;

/// Owns every table of one database directory and the schema file describing them.
///
/// Passed by reference to whoever needs a table; there is no process-wide registry.
#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    options: CatalogOptions,
    schemas: Vec<TableSchema>,
    tables: HashMap<String, TableHandle>,
}

impl Catalog {
    /// Opens `dir` (creating it if needed) and every table listed in its schema file.
    pub fn open(dir: impl AsRef<Path>, options: CatalogOptions) -> RecStoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut catalog = Catalog {
            schemas: Vec::new(),
            tables: HashMap::new(),
            dir,
            options,
        };
        for schema in load_schemas(&catalog.schema_path())? {
            if catalog.tables.contains_key(&table_key(&schema.name)) {
                return Err(RecStoreError::Corrupt(format!(
                    "schema file lists table {} twice",
                    schema.name
                )));
            }
            catalog.open_table(schema)?;
        }
        info!(
            "opened catalog {:?} with {} tables",
            catalog.dir,
            catalog.schemas.len()
        );
        Ok(catalog)
    }

    pub fn create_table(&mut self, schema: TableSchema) -> RecStoreResult<TableHandle> {
        schema.validate()?;
        if self.tables.contains_key(&table_key(&schema.name)) {
            return Err(RecStoreError::TableExists(schema.name));
        }
        // an unencodable schema fails before any file is touched
        let slot = encode_schema(&schema)?;
        let name = schema.name.clone();
        let handle = self.open_table(schema)?;
        if let Err(e) = append_slot(&self.schema_path(), &slot) {
            self.tables.remove(&table_key(&name));
            self.schemas.pop();
            return Err(e);
        }
        info!("created table {}", name);
        Ok(handle)
    }

    fn open_table(&mut self, schema: TableSchema) -> RecStoreResult<TableHandle> {
        let path = self.dir.join(schema.file_name());
        let engine = TableEngine::open(&path, schema.table_options(&self.options))?;
        let handle = Arc::new(RwLock::new(engine));
        debug!("registered table {} at {:?}", schema.name, path);
        self.tables.insert(table_key(&schema.name), handle.clone());
        self.schemas.push(schema);
        Ok(handle)
    }

    /// Looks a table up by name, ignoring ASCII case.
    pub fn table(&self, name: &str) -> RecStoreResult<TableHandle> {
        self.tables
            .get(&table_key(name))
            .cloned()
            .ok_or_else(|| RecStoreError::TableNotFound(name.to_string()))
    }

    pub fn describe(&self, name: &str) -> RecStoreResult<&TableSchema> {
        self.schemas
            .iter()
            .find(|schema| schema.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| RecStoreError::TableNotFound(name.to_string()))
    }

    /// Table names in creation order.
    pub fn table_names(&self) -> Vec<String> {
        self.schemas.iter().map(|s| s.name.clone()).collect()
    }

    /// `(name, live record count)` for every table, in creation order.
    pub fn table_sizes(&self) -> Vec<(String, usize)> {
        self.schemas
            .iter()
            .filter_map(|schema| {
                let handle = self.tables.get(&table_key(&schema.name))?;
                let len = handle.read().len();
                Some((schema.name.clone(), len))
            })
            .collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn schema_path(&self) -> PathBuf {
        self.dir.join(SCHEMA_FILE_NAME)
    }

    /// Flushes and drops every table together.
    pub fn close(self) -> RecStoreResult<()> {
        let mut first_error = None;
        for (name, handle) in self.tables {
            let result = match Arc::try_unwrap(handle) {
                Ok(lock) => lock.into_inner().close(),
                // still borrowed by a caller; flush what we can
                Err(shared) => shared.read().flush(),
            };
            if let Err(e) = result {
                debug!("closing table {} failed: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        info!("closed catalog {:?}", self.dir);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn table_key(name: &str) -> String {
    name.to_ascii_lowercase()
}
