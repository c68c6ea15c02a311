//! Collateral-Change Detector
//!
//! Full before/after row comparison. Anything that changed and was not
//! declared is reported: modifications of rows that were not update or
//! delete targets, deletions of rows that were not delete targets, and new
//! rows that no declared insert accounts for.

use super::intent::{record_matches_row, record_targets_row};
use super::report::{Category, Finding};
use crate::changeset::{Changeset, Record};
use crate::snapshot::{ChangeType, DataSnapshot, DiffEngine, Row, RowChange};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Declared operations on one table
#[derive(Default)]
struct Declared<'a> {
    key_columns: &'a [String],
    updates: Vec<&'a Record>,
    deletes: Vec<&'a Record>,
    inserts: Vec<&'a Record>,
}

impl Declared<'_> {
    fn updates_row(&self, row: &Row) -> bool {
        self.updates.iter().any(|r| record_targets_row(r, self.key_columns, row))
    }

    fn deletes_row(&self, row: &Row) -> bool {
        self.deletes.iter().any(|r| record_targets_row(r, self.key_columns, row))
    }
}

pub struct CollateralDetector;

impl CollateralDetector {
    pub fn detect(initial: &DataSnapshot, final_snapshot: &DataSnapshot, changeset: &Changeset) -> Vec<Finding> {
        let mut declared: BTreeMap<&str, Declared> = BTreeMap::new();
        for ops in changeset.tables() {
            let entry = declared.entry(ops.table.as_str()).or_default();
            entry.key_columns = ops.key_columns.as_slice();
            entry.updates.extend(ops.update.iter());
            entry.deletes.extend(ops.delete.iter());
            entry.inserts.extend(ops.insert.iter());
        }

        // content-keyed rows change key when edited: an update shows up as
        // the old row removed and the new row added
        let content_keyed = |snapshot: &DataSnapshot, change: &RowChange, row: &Row| {
            snapshot
                .table(&change.table)
                .is_some_and(|t| t.is_content_keyed(&change.key, row))
        };

        let mut findings = Vec::new();
        for change in DiffEngine::diff_snapshots(initial, final_snapshot) {
            let ops = declared.get_mut(change.table.as_str());
            match change.change_type {
                ChangeType::Modified => {
                    let before = change.before.clone().unwrap_or_default();
                    if !ops.is_some_and(|d| d.updates_row(&before) || d.deletes_row(&before)) {
                        findings.push(Self::modification(&change));
                    }
                }
                ChangeType::Removed => {
                    let before = change.before.clone().unwrap_or_default();
                    let rewritten = content_keyed(initial, &change, &before);
                    let accounted = ops.is_some_and(|d| {
                        d.deletes_row(&before) || (rewritten && d.updates_row(&before))
                    });
                    if !accounted {
                        findings.push(
                            Finding::new(
                                Category::CollateralChangeError,
                                format!("unrelated deletion of row {} in '{}'", change.key, change.table),
                            )
                            .in_table(&change.table)
                            .with("change", "deletion")
                            .with("row_key", change.key.as_str())
                            .with("before", Self::row_json(Some(&before))),
                        );
                    }
                }
                ChangeType::Added => {
                    let after = change.after.clone().unwrap_or_default();
                    let rewritten = content_keyed(final_snapshot, &change, &after);
                    let accounted = ops.is_some_and(|d| {
                        // each declared insert accounts for one new row
                        if let Some(pos) = d.inserts.iter().position(|r| record_matches_row(r, &after)) {
                            d.inserts.remove(pos);
                            return true;
                        }
                        rewritten && d.updates.iter().any(|r| record_matches_row(r, &after))
                    });
                    if !accounted {
                        findings.push(
                            Finding::new(
                                Category::CollateralChangeError,
                                format!("unrelated addition of row {} in '{}'", change.key, change.table),
                            )
                            .in_table(&change.table)
                            .with("change", "addition")
                            .with("row_key", change.key.as_str())
                            .with("after", Self::row_json(Some(&after))),
                        );
                    }
                }
            }
        }

        debug!("Collateral detector: {} unrelated changes", findings.len());
        findings
    }

    fn modification(change: &RowChange) -> Finding {
        let names: Vec<&str> = change.fields.keys().map(String::as_str).collect();
        let fields: Map<String, Value> = change
            .fields
            .iter()
            .map(|(name, fc)| {
                (
                    name.clone(),
                    serde_json::json!({"old": fc.old, "new": fc.new}),
                )
            })
            .collect();

        Finding::new(
            Category::CollateralChangeError,
            format!(
                "unrelated modification of row {} in '{}': {}",
                change.key,
                change.table,
                names.join(", ")
            ),
        )
        .in_table(&change.table)
        .with("change", "modification")
        .with("row_key", change.key.as_str())
        .with("fields", Value::Object(fields))
    }

    fn row_json(row: Option<&Row>) -> Value {
        row.map(|r| Value::Object(r.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
            .unwrap_or(Value::Null)
    }
}
