//! Placeholder resolution
//!
//! Runs against the sandbox before any statement executes. Each placeholder
//! defined by an insert key gets a concrete id and every use of it is
//! substituted, so the applier only ever sees concrete values.

use super::model::{Changeset, Reference, TableOperations};
use crate::error::SimulationError;
use crate::introspection::{quote_ident, Schema};
use rusqlite::Connection;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use uuid::Uuid;

/// Resolved changeset and the placeholder → id mapping used
#[derive(Debug, Clone)]
pub struct Resolution {
    pub changeset: Changeset,
    pub resolved: BTreeMap<String, Value>,
    /// Placeholders still present after resolution (table, field, token)
    pub unresolved: Vec<(String, String, String)>,
}

pub struct PlaceholderResolver;

impl PlaceholderResolver {
    pub fn resolve(
        changeset: &Changeset,
        schema: &Schema,
        conn: &Connection,
    ) -> Result<Resolution, SimulationError> {
        let mut resolved: BTreeMap<String, Value> = BTreeMap::new();
        // next integer per (table, column); None once i64 is exhausted
        let mut next_int: HashMap<(String, String), Option<i64>> = HashMap::new();

        for ops in changeset.tables() {
            let table = schema.table(&ops.table);
            for record in &ops.insert {
                for column in &ops.key_columns {
                    let Some(token) = record.get(column).and_then(Reference::placeholder) else {
                        continue;
                    };
                    if resolved.contains_key(token) {
                        continue;
                    }

                    let integer_key = table
                        .and_then(|t| t.column(column))
                        .is_some_and(|c| c.is_integer_typed());

                    let value = if integer_key {
                        let slot = (ops.table.clone(), column.clone());
                        let next = match next_int.get(&slot) {
                            Some(next) => *next,
                            None => Self::seed_integer(conn, ops, column)?,
                        };
                        let Some(id) = next else {
                            warn!("No integer id left for {} in '{}.{}'", token, ops.table, column);
                            continue;
                        };
                        next_int.insert(slot, id.checked_add(1));
                        Value::from(id)
                    } else {
                        let name = format!("{}:{}:{}", ops.table, token, changeset.digest());
                        Value::String(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
                    };

                    debug!("Resolved placeholder {} -> {}", token, value);
                    resolved.insert(token.to_string(), value);
                }
            }
        }

        let mut unresolved = Vec::new();
        let changeset = changeset.map_references(|table, field, reference| match reference {
            Reference::Placeholder(token) => match resolved.get(token) {
                Some(value) => Reference::Concrete(value.clone()),
                None => {
                    unresolved.push((table.to_string(), field.to_string(), token.clone()));
                    reference.clone()
                }
            },
            concrete => concrete.clone(),
        });

        Ok(Resolution {
            changeset,
            resolved,
            unresolved,
        })
    }

    /// First free id: past both the stored rows and the ids this batch inserts
    fn seed_integer(
        conn: &Connection,
        ops: &TableOperations,
        column: &str,
    ) -> Result<Option<i64>, SimulationError> {
        let stored = Self::max_integer(conn, &ops.table, column)?;
        let declared = ops
            .insert
            .iter()
            .filter_map(|record| record.get(column).and_then(Reference::concrete))
            .filter_map(|value| match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        Ok(stored.max(declared).checked_add(1))
    }

    fn max_integer(conn: &Connection, table: &str, column: &str) -> Result<i64, SimulationError> {
        let sql = format!(
            "SELECT COALESCE(MAX({}), 0) FROM {} WHERE typeof({}) = 'integer'",
            quote_ident(column),
            quote_ident(table),
            quote_ident(column)
        );
        Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?)
    }
}
