//! Diff/Intent Verifier
//!
//! Confirms every declared change landed exactly once by comparing the
//! initial and final snapshots against the changeset.

use super::report::{Category, Finding};
use crate::changeset::{Changeset, OperationKind, Record, Reference, TableOperations};
use crate::snapshot::values::{key_text, values_match};
use crate::snapshot::{DataSnapshot, Row};
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Every concrete declared field equals the stored value.
/// Placeholder fields are ignored.
pub fn record_matches_row(record: &Record, row: &Row) -> bool {
    record.fields().iter().all(|(field, reference)| match reference {
        Reference::Placeholder(_) => true,
        Reference::Concrete(declared) => row
            .get(field)
            .is_some_and(|stored| values_match(declared, stored)),
    })
}

/// Concrete key values of a record, `None` if any key column is missing or a placeholder
pub fn record_key_values<'a>(record: &'a Record, key_columns: &[String]) -> Option<Vec<&'a Value>> {
    key_columns
        .iter()
        .map(|c| record.get(c).and_then(Reference::concrete))
        .collect()
}

/// Snapshot key for a record, `None` if any key column is missing or a placeholder
pub fn record_key(record: &Record, key_columns: &[String]) -> Option<String> {
    record_key_values(record, key_columns).map(|values| key_text(&values))
}

/// True when `row` holds the record's key values
pub fn record_targets_row(record: &Record, key_columns: &[String], row: &Row) -> bool {
    record_key_values(record, key_columns).is_some_and(|values| {
        key_columns
            .iter()
            .zip(values)
            .all(|(c, v)| row.get(c).is_some_and(|stored| values_match(v, stored)))
    })
}

pub struct IntentVerifier;

impl IntentVerifier {
    pub fn verify_intended_changes(
        initial: &DataSnapshot,
        final_snapshot: &DataSnapshot,
        changeset: &Changeset,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();

        for ops in changeset.tables() {
            Self::verify_inserts(final_snapshot, ops, &mut findings);
            Self::verify_updates(final_snapshot, ops, &mut findings);
            Self::verify_deletes(final_snapshot, ops, &mut findings);
            Self::verify_counts(initial, final_snapshot, ops, &mut findings);
        }

        findings
    }

    fn verify_inserts(final_snapshot: &DataSnapshot, ops: &TableOperations, findings: &mut Vec<Finding>) {
        let Some(table) = final_snapshot.table(&ops.table) else {
            return;
        };
        let mut claimed: BTreeSet<&str> = BTreeSet::new();

        for record in &ops.insert {
            // direct lookup when the key is known, otherwise scan
            let direct = record_key(record, &ops.key_columns)
                .filter(|_| table.key_columns.is_some())
                .and_then(|key| table.rows.get_key_value(&key))
                .filter(|(k, row)| !claimed.contains(k.as_str()) && record_matches_row(record, row))
                .map(|(k, _)| k.as_str());
            let found = direct.or_else(|| {
                table
                    .rows
                    .iter()
                    .find(|(k, row)| !claimed.contains(k.as_str()) && record_matches_row(record, row))
                    .map(|(k, _)| k.as_str())
            });

            match found {
                Some(key) => {
                    claimed.insert(key);
                }
                None => findings.push(
                    Finding::new(
                        Category::IntentMismatchError,
                        format!("inserted row not found in '{}'", ops.table),
                    )
                    .in_table(&ops.table)
                    .with("operation", OperationKind::Insert.key())
                    .with("record", record.to_json()),
                ),
            }
        }
    }

    fn verify_updates(final_snapshot: &DataSnapshot, ops: &TableOperations, findings: &mut Vec<Finding>) {
        for record in &ops.update {
            let id = record.key_value(&ops.key_columns);
            let rows = record_key_values(record, &ops.key_columns)
                .map(|values| final_snapshot.rows_matching(&ops.table, &ops.key_columns, &values))
                .unwrap_or_default();

            if rows.is_empty() {
                findings.push(
                    Finding::new(
                        Category::IntentMismatchError,
                        format!("updated row {} not found in '{}'", id, ops.table),
                    )
                    .in_table(&ops.table)
                    .with("operation", OperationKind::Update.key())
                    .with("id", id),
                );
                continue;
            }

            for (field, reference) in record.fields() {
                if ops.key_columns.contains(field) {
                    continue;
                }
                let Reference::Concrete(expected) = reference else {
                    continue;
                };
                // a key repeated in a keyless table updates every copy
                let mismatch = rows
                    .iter()
                    .map(|(_, row)| row.get(field).cloned().unwrap_or(Value::Null))
                    .find(|actual| !values_match(expected, actual));
                if let Some(actual) = mismatch {
                    findings.push(
                        Finding::new(
                            Category::IntentMismatchError,
                            format!(
                                "'{}.{}' of row {} is {} but {} was declared",
                                ops.table, field, id, actual, expected
                            ),
                        )
                        .in_table(&ops.table)
                        .with("operation", OperationKind::Update.key())
                        .with("id", id.clone())
                        .with("field", field.as_str())
                        .with("expected", expected.clone())
                        .with("actual", actual),
                    );
                }
            }
        }
    }

    fn verify_deletes(final_snapshot: &DataSnapshot, ops: &TableOperations, findings: &mut Vec<Finding>) {
        for record in &ops.delete {
            let Some(values) = record_key_values(record, &ops.key_columns) else {
                continue;
            };
            if !final_snapshot.rows_matching(&ops.table, &ops.key_columns, &values).is_empty() {
                let id = record.key_value(&ops.key_columns);
                findings.push(
                    Finding::new(
                        Category::IntentMismatchError,
                        format!("deleted row {} is still present in '{}'", id, ops.table),
                    )
                    .in_table(&ops.table)
                    .with("operation", OperationKind::Delete.key())
                    .with("id", id),
                );
            }
        }
    }

    /// `initial + inserted - deleted == final`. Deletes of rows that never
    /// existed (not initially, not inserted by this batch) are not counted.
    fn verify_counts(
        initial: &DataSnapshot,
        final_snapshot: &DataSnapshot,
        ops: &TableOperations,
        findings: &mut Vec<Finding>,
    ) {
        // identity-keyed tables hold at most one row per key
        let identity_keyed = initial
            .table(&ops.table)
            .is_some_and(|t| t.key_columns.as_deref() == Some(ops.key_columns.as_slice()));

        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut deleted = 0;
        for record in &ops.delete {
            let Some(values) = record_key_values(record, &ops.key_columns) else {
                continue;
            };
            if !seen.insert(key_text(&values)) {
                continue;
            }
            let existing = initial.rows_matching(&ops.table, &ops.key_columns, &values).len();
            let inserted = ops
                .insert
                .iter()
                .filter_map(|r| record_key_values(r, &ops.key_columns))
                .filter(|inserted| inserted.iter().zip(&values).all(|(a, b)| values_match(a, b)))
                .count();
            deleted += if identity_keyed {
                (existing + inserted).min(1)
            } else {
                existing + inserted
            };
        }

        let before = initial.row_count(&ops.table);
        let after = final_snapshot.row_count(&ops.table);
        let expected = (before + ops.insert.len()).saturating_sub(deleted);

        if expected != after {
            findings.push(
                Finding::new(
                    Category::IntentMismatchError,
                    format!(
                        "'{}' has {} rows; expected {} ({} initial + {} inserted - {} deleted)",
                        ops.table,
                        after,
                        expected,
                        before,
                        ops.insert.len(),
                        deleted
                    ),
                )
                .in_table(&ops.table)
                .with(
                    "counts",
                    json!({
                        "initial": before,
                        "inserted": ops.insert.len(),
                        "deleted": deleted,
                        "expected": expected,
                        "final": after,
                    }),
                ),
            );
        }
    }
}
