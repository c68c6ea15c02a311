//! Snapshot Capturer
//!
//! Full point-in-time capture of every table's rows. Rows are keyed by their
//! declared primary key, or by a content hash for tables without one. A row
//! whose key is NULL or repeats an earlier row's key is content-keyed too.

use super::values::{key_text, sql_to_json, values_match};
use crate::error::SimulationError;
use crate::introspection::{quote_ident, Schema, TableSchema};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

/// One row: column name to value
pub type Row = BTreeMap<String, Value>;

/// Rows of one table keyed by identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    /// Identity columns, `None` when rows are keyed by content hash
    pub key_columns: Option<Vec<String>>,
    pub rows: BTreeMap<String, Row>,
    /// Rows content-keyed despite identity columns (NULL or repeated key)
    #[serde(default)]
    pub unkeyed_rows: usize,
}

impl TableData {
    /// Identity key of `row`, if the table has identity columns
    pub fn identity_key(&self, row: &Row) -> Option<String> {
        let columns = self.key_columns.as_ref()?;
        let values: Vec<&Value> = columns.iter().map(|c| row.get(c).unwrap_or(&Value::Null)).collect();
        Some(key_text(&values))
    }

    /// True when `key` is a content key rather than `row`'s identity key
    pub fn is_content_keyed(&self, key: &str, row: &Row) -> bool {
        !self.identity_key(row).is_some_and(|identity| identity == key)
    }

    /// Rows whose `columns` hold `values`. Uses the key index when the table
    /// is keyed by exactly those columns, otherwise compares loosely row by row.
    pub fn rows_matching(&self, columns: &[String], values: &[&Value]) -> Vec<(&str, &Row)> {
        if self.unkeyed_rows == 0 && self.key_columns.as_deref() == Some(columns) {
            return self
                .rows
                .get_key_value(&key_text(values))
                .map(|(k, row)| (k.as_str(), row))
                .into_iter()
                .collect();
        }
        self.rows
            .iter()
            .filter(|(_, row)| {
                columns
                    .iter()
                    .zip(values)
                    .all(|(c, v)| row.get(c).is_some_and(|stored| values_match(v, stored)))
            })
            .map(|(k, row)| (k.as_str(), row))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Table counts and checksum, as reported in run metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub table_counts: BTreeMap<String, usize>,
    pub checksum: String,
}

/// Immutable capture of a whole database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub captured_at: DateTime<Utc>,
    pub checksum: String,
    tables: BTreeMap<String, TableData>,
}

impl DataSnapshot {
    pub fn table(&self, name: &str) -> Option<&TableData> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &TableData)> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn row(&self, table: &str, key: &str) -> Option<&Row> {
        self.tables.get(table).and_then(|t| t.rows.get(key))
    }

    /// Rows of `table` whose `columns` hold `values`
    pub fn rows_matching(&self, table: &str, columns: &[String], values: &[&Value]) -> Vec<(&str, &Row)> {
        self.tables
            .get(table)
            .map(|t| t.rows_matching(columns, values))
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(TableData::len).unwrap_or(0)
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            table_counts: self
                .tables
                .iter()
                .map(|(name, data)| (name.clone(), data.len()))
                .collect(),
            checksum: self.checksum.clone(),
        }
    }
}

pub struct SnapshotCapturer;

impl SnapshotCapturer {
    /// Capture every table in `schema` from `conn`
    pub fn capture(conn: &Connection, schema: &Schema) -> Result<DataSnapshot, SimulationError> {
        let mut tables = BTreeMap::new();
        for table in &schema.tables {
            tables.insert(table.name.clone(), Self::capture_table(conn, table)?);
        }

        let checksum = Self::compute_checksum(&tables);
        debug!(
            "Captured snapshot of {} tables ({} rows), checksum {}",
            tables.len(),
            tables.values().map(TableData::len).sum::<usize>(),
            &checksum[..12]
        );

        Ok(DataSnapshot {
            captured_at: Utc::now(),
            checksum,
            tables,
        })
    }

    fn capture_table(conn: &Connection, table: &TableSchema) -> Result<TableData, SimulationError> {
        let key_columns: Option<Vec<String>> = table
            .identity_columns()
            .map(|cols| cols.into_iter().map(str::to_string).collect());

        let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(&table.name)))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();

        let mut rows = BTreeMap::new();
        let mut unkeyed_rows = 0;
        let mut result = stmt.query([])?;
        while let Some(sql_row) = result.next()? {
            let mut row = Row::new();
            for (i, name) in names.iter().enumerate() {
                row.insert(name.clone(), sql_to_json(sql_row.get_ref(i)?));
            }

            let key = match &key_columns {
                Some(cols) => {
                    let values: Vec<&Value> = cols.iter().map(|c| row.get(c).unwrap_or(&Value::Null)).collect();
                    let key = key_text(&values);
                    if values.iter().any(|v| v.is_null()) || rows.contains_key(&key) {
                        unkeyed_rows += 1;
                        Self::content_key(&row, &rows)
                    } else {
                        key
                    }
                }
                None => Self::content_key(&row, &rows),
            };
            rows.insert(key, row);
        }

        if unkeyed_rows > 0 {
            debug!("{} rows of '{}' have a NULL or repeated key", unkeyed_rows, table.name);
        }
        Ok(TableData {
            key_columns,
            rows,
            unkeyed_rows,
        })
    }

    /// `#<hash>` for the first copy of a row, `#<hash>/n` for duplicates
    fn content_key(row: &Row, existing: &BTreeMap<String, Row>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_string(row).unwrap_or_default().as_bytes());
        let base = format!("#{}", &format!("{:x}", hasher.finalize())[..16]);

        if !existing.contains_key(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{}/{}", base, n))
            .find(|k| !existing.contains_key(k))
            .unwrap_or(base)
    }

    fn compute_checksum(tables: &BTreeMap<String, TableData>) -> String {
        let mut hasher = Sha256::new();
        for (name, data) in tables {
            hasher.update(name.as_bytes());
            for (key, row) in &data.rows {
                hasher.update(key.as_bytes());
                hasher.update(serde_json::to_string(row).unwrap_or_default().as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}
