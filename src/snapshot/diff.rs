//! Diff Engine
//!
//! Two comparisons live here:
//! - [`DiffEngine::generate_diff`]: the changeset restated as per-table
//!   counts plus a flat operation list. Pure, no database involved.
//! - [`DiffEngine::diff_snapshots`]: keyed row comparison of two snapshots.

use super::capture::{DataSnapshot, Row};
use crate::changeset::{Changeset, OperationKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Declared operation counts for one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl OperationCounts {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

/// One declared operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum DiffEntry {
    #[serde(rename = "INSERT")]
    Insert { table: String, data: Value },
    #[serde(rename = "UPDATE")]
    Update {
        table: String,
        id: Value,
        changes: Value,
    },
    #[serde(rename = "DELETE")]
    Delete { table: String, id: Value },
}

/// Changeset restated for reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesetDiff {
    pub summary: BTreeMap<String, OperationCounts>,
    pub details: Vec<DiffEntry>,
    pub total_operations: usize,
}

/// Type of row change detected between snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

/// Old and new value of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// One row that differs between snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub change_type: ChangeType,
    pub table: String,
    pub key: String,
    /// Full row as it was before (removed/modified)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Row>,
    /// Full row as it is after (added/modified)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Row>,
    /// Changed fields, modified rows only
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub fields: BTreeMap<String, FieldChange>,
}

pub struct DiffEngine;

impl DiffEngine {
    /// Restate the changeset as counts plus a flat operation list
    pub fn generate_diff(changeset: &Changeset) -> ChangesetDiff {
        let mut diff = ChangesetDiff::default();

        for ops in changeset.tables() {
            let counts = diff.summary.entry(ops.table.clone()).or_default();
            counts.inserts += ops.insert.len();
            counts.updates += ops.update.len();
            counts.deletes += ops.delete.len();

            for kind in OperationKind::ALL {
                for record in ops.records(kind) {
                    let entry = match kind {
                        OperationKind::Insert => DiffEntry::Insert {
                            table: ops.table.clone(),
                            data: record.to_json(),
                        },
                        OperationKind::Update => {
                            let mut changes = record.to_json();
                            if let Value::Object(map) = &mut changes {
                                for key in &ops.key_columns {
                                    map.remove(key);
                                }
                            }
                            DiffEntry::Update {
                                table: ops.table.clone(),
                                id: record.key_value(&ops.key_columns),
                                changes,
                            }
                        }
                        OperationKind::Delete => DiffEntry::Delete {
                            table: ops.table.clone(),
                            id: record.key_value(&ops.key_columns),
                        },
                    };
                    diff.details.push(entry);
                }
            }
        }

        diff.total_operations = diff.summary.values().map(OperationCounts::total).sum();
        diff
    }

    /// Every row added, removed or modified between two snapshots
    pub fn diff_snapshots(from: &DataSnapshot, to: &DataSnapshot) -> Vec<RowChange> {
        let mut changes = Vec::new();

        let table_names: BTreeSet<&str> = from.tables().chain(to.tables()).map(|(name, _)| name).collect();
        let empty = BTreeMap::new();

        for table in table_names {
            let from_rows = from.table(table).map(|t| &t.rows).unwrap_or(&empty);
            let to_rows = to.table(table).map(|t| &t.rows).unwrap_or(&empty);

            for (key, before) in from_rows {
                match to_rows.get(key) {
                    None => changes.push(RowChange {
                        change_type: ChangeType::Removed,
                        table: table.to_string(),
                        key: key.clone(),
                        before: Some(before.clone()),
                        after: None,
                        fields: BTreeMap::new(),
                    }),
                    Some(after) if after != before => changes.push(RowChange {
                        change_type: ChangeType::Modified,
                        table: table.to_string(),
                        key: key.clone(),
                        fields: Self::diff_fields(before, after),
                        before: Some(before.clone()),
                        after: Some(after.clone()),
                    }),
                    Some(_) => {}
                }
            }

            for (key, after) in to_rows {
                if !from_rows.contains_key(key) {
                    changes.push(RowChange {
                        change_type: ChangeType::Added,
                        table: table.to_string(),
                        key: key.clone(),
                        before: None,
                        after: Some(after.clone()),
                        fields: BTreeMap::new(),
                    });
                }
            }
        }

        changes
    }

    fn diff_fields(before: &Row, after: &Row) -> BTreeMap<String, FieldChange> {
        let columns: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        columns
            .into_iter()
            .filter_map(|col| {
                let old = before.get(col).cloned().unwrap_or(Value::Null);
                let new = after.get(col).cloned().unwrap_or(Value::Null);
                (old != new).then(|| (col.clone(), FieldChange { old, new }))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangesetParser;
    use crate::introspection::SqliteIntrospector;
    use crate::snapshot::SnapshotCapturer;
    use crate::test_support::forms_db;
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;
    use serde_json::json;

    #[test]
    fn test_total_operations_sums_all_tables() {
        let (_dir, path) = forms_db();
        let schema = SqliteIntrospector::introspect_path(&path).unwrap();
        let parsed = ChangesetParser::new(&schema, '$').parse(&json!({
            "option_items": {
                "insert": [{"id": "$opt_paris", "option_set_id": "OS1", "value": "Paris", "label": "Paris"}],
                "update": [{"id": "OPT_TOKYO", "value": "Wuhan", "label": "Wuhan"}],
                "delete": [{"id": "OPT_KYOTO"}]
            },
            "categories": {"delete": [{"id": 1}, {"id": 2}]}
        }));

        let diff = DiffEngine::generate_diff(&parsed.changeset);
        assert_eq!(diff.total_operations, 5);
        assert_eq!(diff.details.len(), 5);
        assert_eq!(
            diff.summary.get("option_items"),
            Some(&OperationCounts { inserts: 1, updates: 1, deletes: 1 })
        );

        let json = serde_json::to_value(&diff).unwrap();
        assert_eq!(json["details"][0]["operation"], "INSERT");
        assert_eq!(json["details"][1]["operation"], "UPDATE");
        assert_eq!(json["details"][1]["id"], "OPT_TOKYO");
        assert_eq!(json["details"][1]["changes"], json!({"label": "Wuhan", "value": "Wuhan"}));
        assert_eq!(json["details"][2], json!({"operation": "DELETE", "table": "option_items", "id": "OPT_KYOTO"}));
    }

    #[test]
    fn test_snapshot_diff_reports_each_kind() {
        let (_dir, path) = forms_db();
        let schema = SqliteIntrospector::introspect_path(&path).unwrap();
        let conn = Connection::open(&path).unwrap();
        let before = SnapshotCapturer::capture(&conn, &schema).unwrap();

        conn.execute_batch(
            "UPDATE option_items SET is_active = 0 WHERE id = 'OPT_OSAKA';
             DELETE FROM option_items WHERE id = 'OPT_KYOTO';
             INSERT INTO option_items (id, option_set_id, value, label) VALUES ('OPT_NARA', 'OS1', 'Nara', 'Nara');",
        )
        .unwrap();
        let after = SnapshotCapturer::capture(&conn, &schema).unwrap();

        let changes = DiffEngine::diff_snapshots(&before, &after);
        assert_eq!(changes.len(), 3);

        let modified = changes.iter().find(|c| c.change_type == ChangeType::Modified).unwrap();
        assert_eq!(modified.key, "OPT_OSAKA");
        assert_eq!(
            modified.fields.get("is_active"),
            Some(&FieldChange { old: json!(1), new: json!(0) })
        );
        assert_eq!(modified.fields.len(), 1);

        assert!(changes.iter().any(|c| c.change_type == ChangeType::Removed && c.key == "OPT_KYOTO"));
        assert!(changes.iter().any(|c| c.change_type == ChangeType::Added && c.key == "OPT_NARA"));
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let (_dir, path) = forms_db();
        let schema = SqliteIntrospector::introspect_path(&path).unwrap();
        let conn = Connection::open(&path).unwrap();
        let a = SnapshotCapturer::capture(&conn, &schema).unwrap();
        let b = SnapshotCapturer::capture(&conn, &schema).unwrap();
        assert!(DiffEngine::diff_snapshots(&a, &b).is_empty());
    }
}
