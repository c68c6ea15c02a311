//! Schema Introspection Module
//!
//! Reads the canonical database's schema once per run: columns, nullability,
//! primary keys, foreign keys and unique indexes. The resulting [`Schema`] is
//! immutable and shared by reference across every validator.

mod cache;

pub use cache::SchemaCache;

use crate::error::SimulationError;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// Complete schema of one database at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub captured_at: DateTime<Utc>,
    pub tables: Vec<TableSchema>,
    pub checksum: String,
}

impl Schema {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        let checksum = Self::compute_checksum(&tables);
        Self {
            captured_at: Utc::now(),
            tables,
            checksum,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table).is_some_and(|t| t.column(column).is_some())
    }

    /// Compute checksum from schema content
    pub fn compute_checksum(tables: &[TableSchema]) -> String {
        let mut hasher = Sha256::new();

        // Hash tables in sorted order for consistency
        let mut sorted: Vec<&TableSchema> = tables.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        for table in sorted {
            hasher.update(table.name.as_bytes());
            for col in &table.columns {
                hasher.update(
                    format!(
                        "{}.{}:{}:{}:{}",
                        table.name, col.name, col.data_type, col.not_null, col.primary_key_ordinal
                    )
                    .as_bytes(),
                );
            }
            for fk in &table.foreign_keys {
                hasher.update(
                    format!(
                        "FK:{}.{}->{}.{}",
                        table.name,
                        fk.column,
                        fk.referenced_table,
                        fk.referenced_column.as_deref().unwrap_or("")
                    )
                    .as_bytes(),
                );
            }
        }

        format!("{:x}", hasher.finalize())
    }
}

/// Table representation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
    pub unique_indexes: Vec<UniqueIndex>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary-key columns in key order, or `id` when the table declares none
    pub fn key_columns(&self) -> Vec<&str> {
        let mut pk: Vec<&Column> = self.columns.iter().filter(|c| c.is_primary_key()).collect();
        if pk.is_empty() {
            return vec!["id"];
        }
        pk.sort_by_key(|c| c.primary_key_ordinal);
        pk.into_iter().map(|c| c.name.as_str()).collect()
    }

    /// Declared primary-key columns identifying a row in snapshots; `None`
    /// when the table has no primary key. A bare `id` column is not unique
    /// and does not count.
    pub fn identity_columns(&self) -> Option<Vec<&str>> {
        self.columns
            .iter()
            .any(Column::is_primary_key)
            .then(|| self.key_columns())
    }

    /// Columns an insert must supply: NOT NULL without a default
    pub fn required_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|c| c.not_null && c.default_value.is_none())
    }

    /// Tables this one references through declared foreign keys
    pub fn parent_tables(&self) -> impl Iterator<Item = &str> {
        self.foreign_keys
            .iter()
            .map(|fk| fk.referenced_table.as_str())
            .filter(move |parent| *parent != self.name)
    }
}

/// Column representation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// 1-based position within the primary key, 0 when not part of it
    pub primary_key_ordinal: u32,
}

impl Column {
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_ordinal > 0
    }

    /// SQLite's INTEGER affinity rule: the declared type contains "INT"
    pub fn is_integer_typed(&self) -> bool {
        self.data_type.to_ascii_uppercase().contains("INT")
    }
}

/// Foreign key relationship (one column of it)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub id: i64,
    pub column: String,
    pub referenced_table: String,
    /// `None` means the parent's primary key
    pub referenced_column: Option<String>,
    pub on_update: String,
    pub on_delete: String,
}

/// Unique index (explicit, from a UNIQUE constraint, or the primary key)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueIndex {
    pub name: String,
    pub columns: Vec<String>,
    /// `c` (CREATE INDEX), `u` (UNIQUE constraint) or `pk`
    pub origin: String,
}

/// Quote an identifier for interpolation into SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema introspector for SQLite
pub struct SqliteIntrospector;

impl SqliteIntrospector {
    /// Open the database read-only and introspect it
    pub fn introspect_path(path: &Path) -> Result<Schema, SimulationError> {
        if !path.exists() {
            return Err(SimulationError::Schema(format!(
                "database not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::introspect(&conn)
    }

    /// Introspect the complete schema from an open connection
    pub fn introspect(conn: &Connection) -> Result<Schema, SimulationError> {
        let names = Self::get_table_names(conn)?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let columns = Self::get_columns(conn, &name)?;
            let foreign_keys = Self::get_foreign_keys(conn, &name)?;
            let unique_indexes = Self::get_unique_indexes(conn, &name)?;
            tables.push(TableSchema {
                name,
                columns,
                foreign_keys,
                unique_indexes,
            });
        }

        let schema = Schema::new(tables);
        debug!(
            "Introspected schema with {} tables, {} FKs",
            schema.tables.len(),
            schema.tables.iter().map(|t| t.foreign_keys.len()).sum::<usize>()
        );
        Ok(schema)
    }

    fn get_table_names(conn: &Connection) -> Result<Vec<String>, SimulationError> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn get_columns(conn: &Connection, table: &str) -> Result<Vec<Column>, SimulationError> {
        let mut stmt = conn.prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let columns = stmt
            .query_map([table], |row| {
                Ok(Column {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    default_value: row.get(3)?,
                    primary_key_ordinal: row.get::<_, i64>(4)?.max(0) as u32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn get_foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKey>, SimulationError> {
        let mut stmt = conn.prepare(
            "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete
             FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )?;
        let foreign_keys = stmt
            .query_map([table], |row| {
                Ok(ForeignKey {
                    id: row.get(0)?,
                    referenced_table: row.get(1)?,
                    column: row.get(2)?,
                    referenced_column: row.get(3)?,
                    on_update: row.get(4)?,
                    on_delete: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(foreign_keys)
    }

    fn get_unique_indexes(conn: &Connection, table: &str) -> Result<Vec<UniqueIndex>, SimulationError> {
        let mut stmt = conn.prepare(
            "SELECT name, origin FROM pragma_index_list(?1) WHERE \"unique\" = 1 AND partial = 0",
        )?;
        let indexes = stmt
            .query_map([table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
        let mut unique_indexes = Vec::with_capacity(indexes.len());
        for (name, origin) in indexes {
            // expression indexes report NULL column names
            let columns = info
                .query_map([&name], |row| row.get::<_, Option<String>>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            if columns.iter().any(Option::is_none) {
                continue;
            }
            unique_indexes.push(UniqueIndex {
                name,
                columns: columns.into_iter().flatten().collect(),
                origin,
            });
        }
        Ok(unique_indexes)
    }
}
