//! Changeset Applier
//!
//! Executes a resolved changeset against a sandbox in a single transaction.
//! A failing statement is recorded and the batch moves on; the transaction
//! commits once every operation has been attempted.

use super::report::{Category, Finding};
use crate::changeset::{Changeset, OperationKind, Record, Reference, TableOperations};
use crate::error::SimulationError;
use crate::introspection::quote_ident;
use crate::sandbox::Sandbox;
use crate::snapshot::values::json_to_sql;
use rusqlite::types::Value as SqlValue;
use rusqlite::{ffi, params_from_iter, Connection, ErrorCode, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// One statement that ran without error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub table: String,
    pub operation: OperationKind,
    pub id: Value,
    pub rows_affected: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    pub success: bool,
    pub applied_operations: Vec<AppliedOperation>,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
}

impl ApplyResult {
    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.errors.iter().chain(self.warnings.iter())
    }
}

pub struct ChangesetApplier;

impl ChangesetApplier {
    /// Open the sandbox and apply `changeset` to it
    pub fn apply(sandbox: &Sandbox, changeset: &Changeset) -> Result<ApplyResult, SimulationError> {
        let mut conn = sandbox.open()?;
        Self::apply_on(&mut conn, changeset)
    }

    /// Apply on an open connection. Tables run in the changeset's order,
    /// each as insert → update → delete.
    pub fn apply_on(conn: &mut Connection, changeset: &Changeset) -> Result<ApplyResult, SimulationError> {
        // Referential checks run after apply, on the final state
        conn.pragma_update(None, "foreign_keys", false)?;

        let tx = conn.transaction()?;
        let mut result = ApplyResult::default();

        for ops in changeset.tables() {
            for kind in OperationKind::ALL {
                for record in ops.records(kind) {
                    Self::apply_record(&tx, ops, kind, record, &mut result);
                }
            }
        }

        tx.commit()?;

        result.success = result.errors.is_empty();
        info!(
            "Applied {} operations ({} failed)",
            result.applied_operations.len(),
            result.errors.len()
        );
        Ok(result)
    }

    fn apply_record(
        tx: &Transaction<'_>,
        ops: &TableOperations,
        kind: OperationKind,
        record: &Record,
        result: &mut ApplyResult,
    ) {
        let id = record.key_value(&ops.key_columns);
        let outcome = match kind {
            OperationKind::Insert => Self::insert(tx, &ops.table, record),
            OperationKind::Update => Self::update(tx, &ops.table, &ops.key_columns, record),
            OperationKind::Delete => Self::delete(tx, &ops.table, &ops.key_columns, record),
        };

        match outcome {
            Ok(rows_affected) => {
                debug!("{} {} {} -> {} row(s)", kind, ops.table, id, rows_affected);
                if kind == OperationKind::Delete && rows_affected == 0 {
                    result.warnings.push(
                        Finding::new(
                            Category::NoOpDelete,
                            format!("delete of {} in '{}' matched no row", id, ops.table),
                        )
                        .in_table(&ops.table)
                        .with("id", id.clone()),
                    );
                }
                result.applied_operations.push(AppliedOperation {
                    table: ops.table.clone(),
                    operation: kind,
                    id,
                    rows_affected,
                });
            }
            Err(err) => {
                let category = Self::classify(&err);
                debug!("{} {} {} failed: {}", kind, ops.table, id, err);
                result.errors.push(
                    Finding::new(category, format!("{} on '{}' failed: {}", kind, ops.table, err))
                        .in_table(&ops.table)
                        .with("operation", kind.key())
                        .with("record", record.to_json())
                        .with("error", err.to_string()),
                );
            }
        }
    }

    fn insert(tx: &Transaction<'_>, table: &str, record: &Record) -> rusqlite::Result<usize> {
        if record.fields().is_empty() {
            return tx.execute(&format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table)), []);
        }

        let columns: Vec<String> = record.fields().keys().map(|c| quote_ident(c)).collect();
        let slots: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let values: Vec<SqlValue> = record.fields().values().map(bind_value).collect();

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            slots.join(", ")
        );
        tx.execute(&sql, params_from_iter(values))
    }

    fn update(
        tx: &Transaction<'_>,
        table: &str,
        key_columns: &[String],
        record: &Record,
    ) -> rusqlite::Result<usize> {
        let changes: Vec<(&String, &Reference)> = record
            .fields()
            .iter()
            .filter(|(name, _)| !key_columns.contains(*name))
            .collect();
        if changes.is_empty() {
            return Ok(0);
        }

        let mut values: Vec<SqlValue> = changes.iter().map(|(_, v)| bind_value(v)).collect();
        let assignments: Vec<String> = changes
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{} = ?{}", quote_ident(name), i + 1))
            .collect();
        let predicate = Self::key_predicate(key_columns, record, changes.len(), &mut values);

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            assignments.join(", "),
            predicate
        );
        tx.execute(&sql, params_from_iter(values))
    }

    fn delete(
        tx: &Transaction<'_>,
        table: &str,
        key_columns: &[String],
        record: &Record,
    ) -> rusqlite::Result<usize> {
        let mut values = Vec::with_capacity(key_columns.len());
        let predicate = Self::key_predicate(key_columns, record, 0, &mut values);
        let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), predicate);
        tx.execute(&sql, params_from_iter(values))
    }

    /// `k1 = ?n AND k2 = ?n+1`, pushing the key values onto `values`
    fn key_predicate(
        key_columns: &[String],
        record: &Record,
        offset: usize,
        values: &mut Vec<SqlValue>,
    ) -> String {
        key_columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                values.push(record.get(column).map(bind_value).unwrap_or(SqlValue::Null));
                format!("{} = ?{}", quote_ident(column), offset + i + 1)
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn classify(err: &rusqlite::Error) -> Category {
        match err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                match e.extended_code {
                    ffi::SQLITE_CONSTRAINT_NOTNULL => Category::RequiredFieldError,
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        Category::UniqueConstraintViolation
                    }
                    ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Category::ForeignKeyViolation,
                    _ => Category::ExecutionError,
                }
            }
            _ => Category::ExecutionError,
        }
    }
}

/// Placeholders should be resolved before apply; any left over are written verbatim
fn bind_value(reference: &Reference) -> SqlValue {
    match reference {
        Reference::Concrete(v) => json_to_sql(v),
        Reference::Placeholder(token) => SqlValue::Text(token.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangesetParser;
    use crate::introspection::SqliteIntrospector;
    use crate::sandbox::SandboxManager;
    use crate::test_support::forms_db;
    use serde_json::json;

    fn apply(input: Value) -> (ApplyResult, Connection, tempfile::TempDir, Sandbox) {
        let (dir, path) = forms_db();
        let schema = SqliteIntrospector::introspect_path(&path).unwrap();
        let parsed = ChangesetParser::new(&schema, '$').parse(&input);
        let sandbox = SandboxManager::default().create(&path).unwrap();
        let result = ChangesetApplier::apply(&sandbox, &parsed.changeset).unwrap();
        let conn = sandbox.open().unwrap();
        (result, conn, dir, sandbox)
    }

    fn value_of(conn: &Connection, id: &str) -> Option<String> {
        conn.query_row("SELECT value FROM option_items WHERE id = ?1", [id], |r| r.get(0))
            .ok()
    }

    #[test]
    fn test_insert_update_delete_in_one_pass() {
        let (result, conn, _dir, _sandbox) = apply(json!({
            "option_items": {
                "insert": [{"id": "OPT_PARIS", "option_set_id": "OS1", "value": "Paris", "label": "Paris", "position": 6}],
                "update": [{"id": "OPT_TOKYO", "value": "Wuhan", "label": "Wuhan"}],
                "delete": [{"id": "OPT_KYOTO"}]
            }
        }));

        assert!(result.success);
        assert_eq!(result.applied_operations.len(), 3);
        assert_eq!(value_of(&conn, "OPT_PARIS").as_deref(), Some("Paris"));
        assert_eq!(value_of(&conn, "OPT_TOKYO").as_deref(), Some("Wuhan"));
        assert_eq!(value_of(&conn, "OPT_KYOTO"), None);
    }

    #[test]
    fn test_failures_do_not_abort_the_batch() {
        let (result, conn, _dir, _sandbox) = apply(json!({
            "option_items": {
                "insert": [
                    {"id": "OPT_TOKYO", "option_set_id": "OS1", "value": "Dup", "label": "Dup"},
                    {"id": "OPT_ROME", "option_set_id": "OS1", "label": "Rome"},
                    {"id": "OPT_LIMA", "option_set_id": "OS1", "value": "Lima", "label": "Lima"}
                ]
            }
        }));

        assert!(!result.success);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].category, Category::UniqueConstraintViolation);
        assert_eq!(result.errors[1].category, Category::RequiredFieldError);
        assert_eq!(result.errors[1].detail("operation").unwrap(), "insert");
        assert!(result.errors[1].detail("error").is_some());

        // the good insert still committed
        assert_eq!(value_of(&conn, "OPT_LIMA").as_deref(), Some("Lima"));
    }

    #[test]
    fn test_fk_enforcement_is_deferred_to_validation() {
        let (result, conn, _dir, _sandbox) = apply(json!({
            "option_items": {
                "insert": [{"id": "OPT_X", "option_set_id": "NO_SUCH_SET", "value": "X", "label": "X"}]
            }
        }));
        assert!(result.success);
        assert_eq!(value_of(&conn, "OPT_X").as_deref(), Some("X"));
    }

    #[test]
    fn test_no_op_delete_is_a_warning() {
        let (result, _conn, _dir, _sandbox) = apply(json!({
            "option_items": {"delete": [{"id": "OPT_GHOST"}]}
        }));

        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].category, Category::NoOpDelete);
        assert_eq!(result.applied_operations[0].rows_affected, 0);
    }

    #[test]
    fn test_composite_key_delete() {
        let (result, conn, _dir, _sandbox) = apply(json!({
            "field_option_binding": {"delete": [{"field_id": "FIELD_CITY", "option_set_id": "OS1"}]}
        }));

        assert!(result.success);
        assert_eq!(result.applied_operations[0].rows_affected, 1);
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM field_option_binding", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
