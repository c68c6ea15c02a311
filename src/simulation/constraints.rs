//! Constraint Validator
//!
//! Pre-apply checks run against the changeset and the canonical schema
//! (required fields, value shapes). Post-apply checks run against the
//! sandbox (foreign keys, uniqueness, orphans, storage integrity).

use super::report::{Category, Finding};
use crate::changeset::{Changeset, OperationKind, Reference};
use crate::config::{OrphanRule, ValidationRules};
use crate::error::SimulationError;
use crate::introspection::{quote_ident, Schema};
use crate::snapshot::values::sql_to_json;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

/// Uniqueness check over one or more columns
#[derive(Debug, Clone, PartialEq, Eq)]
struct UniqueCheck {
    table: String,
    columns: Vec<String>,
}

pub struct ConstraintValidator<'a> {
    schema: &'a Schema,
    rules: &'a ValidationRules,
}

impl<'a> ConstraintValidator<'a> {
    pub fn new(schema: &'a Schema, rules: &'a ValidationRules) -> Self {
        Self { schema, rules }
    }

    /// Inserts must supply every NOT NULL column without a default;
    /// updates must not null out a NOT NULL column
    pub fn validate_required_fields(&self, changeset: &Changeset) -> Vec<Finding> {
        let mut findings = Vec::new();

        for ops in changeset.tables() {
            let Some(table) = self.schema.table(&ops.table) else {
                continue;
            };

            for (index, record) in ops.insert.iter().enumerate() {
                for column in table.required_columns() {
                    if record.get(&column.name).is_some_and(|v| !v.is_null()) {
                        continue;
                    }
                    findings.push(
                        Finding::new(
                            Category::RequiredFieldError,
                            format!("missing required field '{}' for INSERT into '{}'", column.name, ops.table),
                        )
                        .in_table(&ops.table)
                        .with("field", column.name.as_str())
                        .with("operation", OperationKind::Insert.key())
                        .with("index", index)
                        .with("record", record.to_json()),
                    );
                }
            }

            for (index, record) in ops.update.iter().enumerate() {
                for (field, value) in record.fields() {
                    let not_null = table.column(field).is_some_and(|c| c.not_null);
                    if not_null && value.is_null() {
                        findings.push(
                            Finding::new(
                                Category::RequiredFieldError,
                                format!("cannot set required field '{}' to null in '{}'", field, ops.table),
                            )
                            .in_table(&ops.table)
                            .with("field", field.as_str())
                            .with("operation", OperationKind::Update.key())
                            .with("index", index)
                            .with("id", record.key_value(&ops.key_columns)),
                        );
                    }
                }
            }
        }

        findings
    }

    /// Shallow shape heuristics: `id`/`*_id` fields hold identifiers, flag and
    /// ordinal fields hold integers or booleans. Not full type inference.
    pub fn validate_data_types(&self, changeset: &Changeset) -> Vec<Finding> {
        let mut findings = Vec::new();

        for ops in changeset.tables() {
            for kind in OperationKind::ALL {
                for (index, record) in ops.records(kind).iter().enumerate() {
                    for (field, reference) in record.fields() {
                        let Reference::Concrete(value) = reference else {
                            continue;
                        };
                        if value.is_null() {
                            continue;
                        }

                        let expected = if field == "id" || field.ends_with("_id") {
                            (!Self::is_identifier(value)).then_some("a string or integer identifier")
                        } else if self.rules.flag_fields.iter().any(|f| f == field) {
                            (!Self::is_flag(value)).then_some("an integer or boolean")
                        } else {
                            None
                        };

                        if let Some(expected) = expected {
                            findings.push(
                                Finding::new(
                                    Category::TypeMismatchError,
                                    format!("field '{}' in '{}' must be {}, got {}", field, ops.table, expected, value),
                                )
                                .in_table(&ops.table)
                                .with("field", field.as_str())
                                .with("operation", kind.key())
                                .with("index", index)
                                .with("value", value.clone()),
                            );
                        }
                    }
                }
            }
        }

        findings
    }

    fn is_identifier(value: &Value) -> bool {
        match value {
            Value::String(s) => !s.trim().is_empty(),
            Value::Number(n) => n.is_i64() || n.is_u64(),
            _ => false,
        }
    }

    fn is_flag(value: &Value) -> bool {
        matches!(value, Value::Bool(_)) || value.as_i64().is_some()
    }

    /// Native foreign-key consistency check on the sandbox
    pub fn validate_foreign_keys(&self, conn: &Connection) -> Result<Vec<Finding>, SimulationError> {
        conn.pragma_update(None, "foreign_keys", true)?;

        let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
        let violations = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut findings = Vec::with_capacity(violations.len());
        for (table, rowid, parent, fk_index) in violations {
            let mut finding = Finding::new(
                Category::ForeignKeyViolation,
                format!("row in '{}' references a missing '{}' row", table, parent),
            )
            .in_table(&table)
            .with("rowid", rowid)
            .with("parent_table", parent.as_str())
            .with("fk_index", fk_index);

            let fk = self
                .schema
                .table(&table)
                .and_then(|t| t.foreign_keys.iter().find(|fk| fk.id == fk_index));
            if let (Some(fk), Some(rowid)) = (fk, rowid) {
                let sql = format!(
                    "SELECT {} FROM {} WHERE rowid = ?1",
                    quote_ident(&fk.column),
                    quote_ident(&table)
                );
                let value = conn
                    .query_row(&sql, [rowid], |row| Ok(sql_to_json(row.get_ref(0)?)))
                    .optional()?;
                finding.message = format!(
                    "'{}.{}' = {} references a missing '{}' row",
                    table,
                    fk.column,
                    value.clone().unwrap_or(Value::Null),
                    parent
                );
                finding = finding
                    .with("column", fk.column.as_str())
                    .with("value", value.unwrap_or(Value::Null));
            }
            findings.push(finding);
        }

        debug!("Foreign key check: {} violations", findings.len());
        Ok(findings)
    }

    /// Duplicate detection for configured and schema-declared unique columns
    pub fn validate_unique_constraints(&self, conn: &Connection) -> Result<Vec<Finding>, SimulationError> {
        let (checks, mut findings) = self.unique_checks();

        for check in checks {
            let cols: Vec<String> = check.columns.iter().map(|c| quote_ident(c)).collect();
            let not_null: Vec<String> = cols.iter().map(|c| format!("{} IS NOT NULL", c)).collect();
            let sql = format!(
                "SELECT {}, COUNT(*) FROM {} WHERE {} GROUP BY {} HAVING COUNT(*) > 1",
                cols.join(", "),
                quote_ident(&check.table),
                not_null.join(" AND "),
                cols.join(", ")
            );

            let width = check.columns.len();
            let mut stmt = conn.prepare(&sql)?;
            let duplicates = stmt
                .query_map([], |row| {
                    let values = (0..width)
                        .map(|i| row.get_ref(i).map(sql_to_json))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok((values, row.get::<_, i64>(width)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for (values, count) in duplicates {
                let shown = if width == 1 {
                    values[0].clone()
                } else {
                    Value::Array(values)
                };
                findings.push(
                    Finding::new(
                        Category::UniqueConstraintViolation,
                        format!(
                            "{} rows in '{}' share {} = {}",
                            count,
                            check.table,
                            check.columns.join(", "),
                            shown
                        ),
                    )
                    .in_table(&check.table)
                    .with("columns", check.columns.clone())
                    .with("value", shown)
                    .with("count", count),
                );
            }
        }

        Ok(findings)
    }

    /// Orphan detection over configured relationships and declared foreign keys
    pub fn check_referential_integrity(&self, conn: &Connection) -> Result<Vec<Finding>, SimulationError> {
        let (rules, mut findings) = self.orphan_rules();

        for rule in rules {
            let sql = format!(
                "SELECT c.{col}, COUNT(*) FROM {child} c
                 LEFT JOIN {parent} p ON c.{col} = p.{pcol}
                 WHERE c.{col} IS NOT NULL AND p.{pcol} IS NULL
                 GROUP BY c.{col}",
                col = quote_ident(&rule.child_column),
                child = quote_ident(&rule.child_table),
                parent = quote_ident(&rule.parent_table),
                pcol = quote_ident(&rule.parent_column),
            );

            let mut stmt = conn.prepare(&sql)?;
            let orphans = stmt
                .query_map([], |row| Ok((sql_to_json(row.get_ref(0)?), row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            for (value, count) in orphans {
                findings.push(
                    Finding::new(
                        Category::ReferentialIntegrityError,
                        format!(
                            "{} row(s) in '{}' have {} = {} with no matching '{}.{}'",
                            count, rule.child_table, rule.child_column, value, rule.parent_table, rule.parent_column
                        ),
                    )
                    .in_table(&rule.child_table)
                    .with("column", rule.child_column.as_str())
                    .with("value", value)
                    .with("parent_table", rule.parent_table.as_str())
                    .with("parent_column", rule.parent_column.as_str())
                    .with("count", count),
                );
            }
        }

        Ok(findings)
    }

    /// `PRAGMA integrity_check`; anything but `ok` is reported
    pub fn integrity_check(&self, conn: &Connection) -> Result<Vec<Finding>, SimulationError> {
        let mut stmt = conn.prepare("PRAGMA integrity_check")?;
        let lines = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(lines
            .into_iter()
            .filter(|line| line != "ok")
            .map(|line| {
                Finding::new(Category::StorageIntegrityError, format!("integrity check: {}", line))
            })
            .collect())
    }

    /// Configured rules plus schema unique indexes, deduplicated.
    /// Rules naming unknown tables or columns become warnings.
    fn unique_checks(&self) -> (Vec<UniqueCheck>, Vec<Finding>) {
        let mut checks: Vec<UniqueCheck> = Vec::new();
        let mut skipped = Vec::new();

        for rule in &self.rules.unique_rules {
            if !self.schema.has_column(&rule.table, &rule.column) {
                skipped.push(Self::skipped(
                    &rule.table,
                    format!("unique rule {}.{} names a column that does not exist", rule.table, rule.column),
                ));
                continue;
            }
            let check = UniqueCheck {
                table: rule.table.clone(),
                columns: vec![rule.column.clone()],
            };
            if !checks.contains(&check) {
                checks.push(check);
            }
        }

        if self.rules.include_schema_unique_indexes {
            for table in &self.schema.tables {
                for index in &table.unique_indexes {
                    let check = UniqueCheck {
                        table: table.name.clone(),
                        columns: index.columns.clone(),
                    };
                    if !checks.contains(&check) {
                        checks.push(check);
                    }
                }
            }
        }

        (checks, skipped)
    }

    /// Configured orphan rules plus single-column declared foreign keys, deduplicated
    fn orphan_rules(&self) -> (Vec<OrphanRule>, Vec<Finding>) {
        let mut rules: Vec<OrphanRule> = Vec::new();
        let mut skipped = Vec::new();

        for rule in &self.rules.orphan_rules {
            let known = self.schema.has_column(&rule.child_table, &rule.child_column)
                && self.schema.has_column(&rule.parent_table, &rule.parent_column);
            if !known {
                skipped.push(Self::skipped(
                    &rule.child_table,
                    format!(
                        "orphan rule {}.{} -> {}.{} names a table or column that does not exist",
                        rule.child_table, rule.child_column, rule.parent_table, rule.parent_column
                    ),
                ));
                continue;
            }
            if !rules.contains(rule) {
                rules.push(rule.clone());
            }
        }

        if self.rules.include_schema_foreign_keys {
            for table in &self.schema.tables {
                for fk in &table.foreign_keys {
                    // composite keys are left to the native check
                    if table.foreign_keys.iter().filter(|other| other.id == fk.id).count() > 1 {
                        continue;
                    }
                    let parent_column = match &fk.referenced_column {
                        Some(col) => col.clone(),
                        None => match self.schema.table(&fk.referenced_table).map(|p| p.key_columns()) {
                            Some(keys) if keys.len() == 1 => keys[0].to_string(),
                            _ => continue,
                        },
                    };
                    if !self.schema.has_column(&fk.referenced_table, &parent_column) {
                        warn!(
                            "Foreign key {}.{} references missing {}.{}",
                            table.name, fk.column, fk.referenced_table, parent_column
                        );
                        continue;
                    }
                    let rule = OrphanRule {
                        child_table: table.name.clone(),
                        child_column: fk.column.clone(),
                        parent_table: fk.referenced_table.clone(),
                        parent_column,
                    };
                    if !rules.contains(&rule) {
                        rules.push(rule);
                    }
                }
            }
        }

        (rules, skipped)
    }

    fn skipped(table: &str, message: String) -> Finding {
        debug!("Skipping rule: {}", message);
        Finding::new(Category::SkippedRule, message).in_table(table)
    }
}
