use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use comfy_table::Cell;
use recstore::catalog::{Catalog, ColumnDef, ColumnType, TableSchema};
use recstore::config::{CatalogOptions, RecordFormat};
use recstore::error::{RecStoreError, RecStoreResult};
use recstore::{Key, Record};

const TABLE_PRESET: &str = "||--+-++|    ++++++";

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short, long, default_value = ".", help = "Catalog directory")]
    dir: PathBuf,
    #[clap(long, help = "Maintain and trust the <table>.idx side files")]
    index_side_file: bool,
    #[clap(long, help = "sync_data after every write")]
    sync_on_write: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List tables with their live record counts
    Tables,
    /// Show the columns of a table
    Describe { table: String },
    /// Create a table from `name:TYPE[:size]` column specs; the first INT column is the key
    Create {
        table: String,
        #[clap(required_unless_present = "length_prefixed")]
        columns: Vec<String>,
        #[clap(long, help = "Key plus one variable-length text value")]
        length_prefixed: bool,
    },
    /// Insert one record
    Insert {
        table: String,
        #[clap(allow_hyphen_values = true)]
        key: Key,
        fields: Vec<String>,
    },
    /// Print the record stored under a key
    Get {
        table: String,
        #[clap(allow_hyphen_values = true)]
        key: Key,
    },
    /// Print records in key order, optionally bounded on either side
    Scan {
        table: String,
        #[clap(long, allow_hyphen_values = true)]
        min: Option<Key>,
        #[clap(long, allow_hyphen_values = true)]
        max: Option<Key>,
    },
    /// Tombstone the record stored under a key
    Delete {
        table: String,
        #[clap(allow_hyphen_values = true)]
        key: Key,
    },
    /// Check the structural invariants of a table's index
    Verify { table: String },
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> RecStoreResult<()> {
    let options = CatalogOptions {
        index_side_file: args.index_side_file,
        sync_on_write: args.sync_on_write,
        ..Default::default()
    };
    let mut catalog = Catalog::open(&args.dir, options)?;

    match args.command {
        Command::Tables => {
            let mut table = comfy_table::Table::new();
            table.load_preset(TABLE_PRESET);
            table.set_header(vec!["table", "records"]);
            for (name, len) in catalog.table_sizes() {
                table.add_row(vec![Cell::new(name), Cell::new(len)]);
            }
            println!("{}", table);
        }
        Command::Describe { table: name } => {
            let schema = catalog.describe(&name)?;
            let mut table = comfy_table::Table::new();
            table.load_preset(TABLE_PRESET);
            table.set_header(vec!["column", "type", "size", "key"]);
            for (idx, col) in schema.columns.iter().enumerate() {
                let key = if idx == schema.primary_key_index { "*" } else { "" };
                table.add_row(vec![
                    Cell::new(&col.name),
                    Cell::new(col.kind),
                    Cell::new(col.size),
                    Cell::new(key),
                ]);
            }
            println!("{}", table);
        }
        Command::Create {
            table,
            columns,
            length_prefixed,
        } => {
            let schema = if length_prefixed {
                TableSchema::length_prefixed(table, None)?
            } else {
                let columns = columns
                    .iter()
                    .map(|spec| parse_column(spec))
                    .collect::<RecStoreResult<Vec<_>>>()?;
                let pk = columns
                    .iter()
                    .position(|col| col.kind == ColumnType::Int)
                    .ok_or_else(|| {
                        RecStoreError::InvalidArgument("no INT column for the key".to_string())
                    })?;
                TableSchema::fixed(table, columns, pk, options.default_field_width)?
            };
            catalog.create_table(schema)?;
        }
        Command::Insert { table, key, fields } => {
            let record = build_record(catalog.describe(&table)?, key, &fields)?;
            let offset = catalog.table(&table)?.write().insert(&record)?;
            println!("inserted key {} at offset {}", key, offset);
        }
        Command::Get { table, key } => {
            let schema = catalog.describe(&table)?;
            let handle = catalog.table(&table)?;
            let record = handle
                .read()
                .find(key)?
                .ok_or(RecStoreError::KeyNotFound(key))?;
            println!("{}", render(schema, vec![record]));
        }
        Command::Scan { table, min, max } => {
            let schema = catalog.describe(&table)?;
            let handle = catalog.table(&table)?;
            let engine = handle.read();
            let records = engine
                .scan_range(min.unwrap_or(Key::MIN), max.unwrap_or(Key::MAX))?
                .collect::<RecStoreResult<Vec<_>>>()?;
            println!("{}", render(schema, records));
        }
        Command::Delete { table, key } => {
            let offset = catalog.table(&table)?.write().delete(key)?;
            println!("deleted key {} at offset {}", key, offset);
        }
        Command::Verify { table } => {
            let handle = catalog.table(&table)?;
            let engine = handle.read();
            let index = engine.index();
            index.check_invariants()?;
            println!(
                "{}: ok ({} keys, height {}, {} nodes)",
                table,
                index.len(),
                index.height(),
                index.node_count()
            );
        }
    }
    catalog.close()
}

fn parse_column(spec: &str) -> RecStoreResult<ColumnDef> {
    let invalid = || RecStoreError::InvalidArgument(format!("bad column spec {:?}", spec));
    let mut parts = spec.split(':');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
    let kind = parts
        .next()
        .and_then(|k| ColumnType::from_str(k).ok())
        .ok_or_else(invalid)?;
    let size = match parts.next() {
        Some(size) => size.parse::<usize>().map_err(|_| invalid())?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(ColumnDef::new(name.to_string(), kind, size))
}

fn build_record(schema: &TableSchema, key: Key, fields: &[String]) -> RecStoreResult<Record> {
    match &schema.format {
        RecordFormat::Fixed(layout) => {
            let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
            Record::from_fields(key, &fields, layout)
        }
        RecordFormat::LengthPrefixed { .. } => Ok(Record::text(key, &fields.join(" "))),
    }
}

fn render(schema: &TableSchema, records: Vec<Record>) -> comfy_table::Table {
    let mut table = comfy_table::Table::new();
    table.load_preset(TABLE_PRESET);
    let key_name = schema
        .columns
        .get(schema.primary_key_index)
        .map(|col| col.name.clone())
        .unwrap_or_else(|| "key".to_string());

    match &schema.format {
        RecordFormat::Fixed(layout) => {
            let mut header = vec![key_name];
            header.extend(schema.payload_columns().map(|col| col.name.clone()));
            table.set_header(header);
            for record in records {
                let mut cells = vec![Cell::new(record.key)];
                cells.extend(record.fields(layout).into_iter().map(Cell::new));
                table.add_row(cells);
            }
        }
        RecordFormat::LengthPrefixed { .. } => {
            table.set_header(vec![key_name, "text".to_string()]);
            for record in records {
                table.add_row(vec![Cell::new(record.key), Cell::new(record.as_text())]);
            }
        }
    }
    table
}
